//! Process-wide softphone
//!
//! Holds the one signaling agent of the process and the call core bound to
//! it. Mounting a presentation layer reuses both; only `restart` (new
//! credentials) and `shutdown` (logout) tear them down.

use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;

use crate::call::{CallControl, CallCore, CoreDeps};
use crate::cdr::Finalizer;
use crate::config::{ConfigError, CoreConfig};
use crate::media::MediaDevices;
use crate::sip::{Credentials, SignalingAgent, TransportFactory};

struct Session {
    agent: Arc<SignalingAgent>,
    control: Option<CallControl>,
}

pub struct Softphone {
    factory: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaDevices>,
    finalizer: Arc<Finalizer>,
    config: CoreConfig,
    session: Mutex<Option<Session>>,
}

impl Softphone {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaDevices>,
        finalizer: Arc<Finalizer>,
        config: CoreConfig,
    ) -> Self {
        Self {
            factory,
            media,
            finalizer,
            config,
            session: Mutex::new(None),
        }
    }

    /// Start the agent for `credentials`, or reuse the running one.
    ///
    /// A running agent with other credentials is replaced. Registration
    /// failures are reported through the agent's status, not as an error.
    pub async fn ensure_started(
        &self,
        credentials: Credentials,
    ) -> Result<Arc<SignalingAgent>, ConfigError> {
        credentials.validate()?;
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_ref() {
            if current.agent.credentials() == &credentials {
                let agent = current.agent.clone();
                drop(session);
                if let Err(e) = agent.ensure_registered().await {
                    tracing::warn!("Re-registration failed: {}", e);
                }
                return Ok(agent);
            }
            tracing::info!(
                "Credentials changed ({} -> {}), restarting agent",
                current.agent.credentials().extension,
                credentials.extension
            );
            if let Some(previous) = session.take() {
                stop_session(previous).await;
            }
        }

        let agent = SignalingAgent::start(credentials, self.factory.as_ref());
        *session = Some(Session {
            agent: agent.clone(),
            control: None,
        });
        drop(session);

        if let Err(e) = agent.ensure_registered().await {
            tracing::warn!("Initial registration failed: {}", e);
        }
        Ok(agent)
    }

    /// Attach a presentation layer: start the agent if needed and return the
    /// call control of its (single) call core. A running core is made the
    /// agent's listener again.
    pub async fn mount(&self, credentials: Credentials) -> Result<CallControl, ConfigError> {
        self.ensure_started(credentials).await?;

        let mut session = self.session.lock().await;
        let Some(current) = session.as_mut() else {
            return Err(ConfigError::Invalid("softphone was shut down".to_string()));
        };
        if let Some(control) = current.control.as_ref().filter(|c| c.is_running()) {
            match control.rebind().await {
                Ok(()) => return Ok(control.clone()),
                Err(e) => tracing::warn!("Call core could not rebind, starting a new one: {}", e),
            }
        }

        let (control, _) = CallCore::spawn(CoreDeps {
            agent: current.agent.clone(),
            media: self.media.clone(),
            finalizer: self.finalizer.clone(),
            config: self.config.clone(),
        });
        current.control = Some(control.clone());
        Ok(control)
    }

    pub async fn control(&self) -> Option<CallControl> {
        self.session
            .lock()
            .await
            .as_ref()
            .and_then(|session| session.control.clone())
    }

    pub async fn agent(&self) -> Option<Arc<SignalingAgent>> {
        self.session.lock().await.as_ref().map(|session| session.agent.clone())
    }

    /// Stop the current agent and start one for `credentials`
    pub async fn restart(&self, credentials: Credentials) -> Result<Arc<SignalingAgent>, ConfigError> {
        let previous = self.session.lock().await.take();
        if let Some(previous) = previous {
            stop_session(previous).await;
        }
        self.ensure_started(credentials).await
    }

    /// Logout: hang up, stop the agent and forget it
    pub async fn shutdown(&self) {
        let previous = self.session.lock().await.take();
        match previous {
            Some(previous) => stop_session(previous).await,
            None => tracing::debug!("Softphone shutdown with no agent running"),
        }
    }
}

async fn stop_session(session: Session) {
    if let Some(control) = session.control {
        control.shutdown().await;
    }
    session.agent.stop().await;
}

static SOFTPHONE: OnceLock<Softphone> = OnceLock::new();

/// Install the process-wide softphone; false if one is already installed
pub fn init_softphone(softphone: Softphone) -> bool {
    SOFTPHONE.set(softphone).is_ok()
}

pub fn softphone() -> Option<&'static Softphone> {
    SOFTPHONE.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::scenario_tests::{FakeDevices, FakeFactory, FakeStore, FakeTransport};
    use crate::call::CallState;
    use crate::cdr::NameResolver;
    use crate::sip::{CallHandle, RegistrationStatus, SessionEvent, SignalingEvent};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn softphone() -> (Softphone, Arc<FakeFactory>, Arc<FakeTransport>) {
        let (phone, factory, transport, _) = softphone_with_store();
        (phone, factory, transport)
    }

    fn softphone_with_store() -> (Softphone, Arc<FakeFactory>, Arc<FakeTransport>, Arc<FakeStore>) {
        let transport = Arc::new(FakeTransport::default());
        let factory = Arc::new(FakeFactory::new(transport.clone()));
        let store = Arc::new(FakeStore::default());
        let finalizer = Arc::new(Finalizer::new(store.clone(), NameResolver::new(None, None)));
        let phone = Softphone::new(
            factory.clone(),
            Arc::new(FakeDevices::default()),
            finalizer,
            CoreConfig::default(),
        );
        (phone, factory, transport, store)
    }

    fn registers(transport: &FakeTransport) -> usize {
        transport.ops().iter().filter(|op| op.as_str() == "register").count()
    }

    #[tokio::test]
    async fn test_ensure_started_is_idempotent() {
        let (phone, factory, transport) = softphone();
        let first = phone.ensure_started(Credentials::new("1001", "pw")).await.unwrap();
        let second = phone.ensure_started(Credentials::new("1001", "pw")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
        assert_eq!(registers(&transport), 1);
        assert_eq!(first.status(), RegistrationStatus::Registered);
    }

    #[tokio::test]
    async fn test_new_credentials_restart_the_agent() {
        let (phone, factory, transport) = softphone();
        let first = phone.ensure_started(Credentials::new("1001", "pw")).await.unwrap();
        let second = phone.ensure_started(Credentials::new("1002", "pw")).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
        assert_eq!(first.status(), RegistrationStatus::Unregistered);
        assert_eq!(second.credentials().extension, "1002");
        assert!(transport.ops().contains(&"shutdown".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_credentials_are_refused() {
        let (phone, factory, _) = softphone();
        assert!(phone.ensure_started(Credentials::new("", "pw")).await.is_err());
        assert_eq!(factory.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remount_reuses_agent_and_core() {
        let (phone, factory, transport) = softphone();
        let first = phone.mount(Credentials::new("1001", "pw")).await.unwrap();
        let second = phone.mount(Credentials::new("1001", "pw")).await.unwrap();

        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
        assert_eq!(registers(&transport), 1);

        factory.emit(SignalingEvent::IncomingCall {
            handle: CallHandle::from("in-1"),
            from: "5550100".to_string(),
            display_name: None,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.status().state, CallState::IncomingRinging);
        assert_eq!(second.status().state, CallState::IncomingRinging);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_the_only_teardown() {
        let (phone, _, transport) = softphone();
        let control = phone.mount(Credentials::new("1001", "pw")).await.unwrap();
        let agent = phone.agent().await.unwrap();

        phone.shutdown().await;
        assert!(!control.is_running());
        assert!(phone.agent().await.is_none());
        assert!(phone.control().await.is_none());
        assert_eq!(agent.status(), RegistrationStatus::Unregistered);
        assert!(transport.ops().contains(&"shutdown".to_string()));

        // A later mount starts from scratch
        let control = phone.mount(Credentials::new("1001", "pw")).await.unwrap();
        assert!(control.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remount_takes_back_a_replaced_listener() {
        let (phone, factory, _) = softphone();
        let control = phone.mount(Credentials::new("1001", "pw")).await.unwrap();
        let agent = phone.agent().await.unwrap();

        let (other_tx, _other_rx) = mpsc::unbounded_channel();
        let other = agent.bind_listeners(other_tx);
        assert!(agent.unbind_listeners(&other));
        assert!(!agent.has_listener());

        let remounted = phone.mount(Credentials::new("1001", "pw")).await.unwrap();
        assert!(control.is_running());
        assert!(agent.has_listener());

        factory.emit(SignalingEvent::IncomingCall {
            handle: CallHandle::from("in-2"),
            from: "5550100".to_string(),
            display_name: None,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(remounted.status().state, CallState::IncomingRinging);
        assert_eq!(control.status().state, CallState::IncomingRinging);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_carry_the_extension_after_restart() {
        let (phone, factory, transport, store) = softphone_with_store();
        phone.mount(Credentials::new("1001", "pw")).await.unwrap();
        phone.restart(Credentials::new("1002", "pw")).await.unwrap();
        let control = phone.mount(Credentials::new("1002", "pw")).await.unwrap();

        control.dial("5551234").await.unwrap();
        let mut handle = None;
        for _ in 0..50 {
            handle = transport.last_invite();
            if handle.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let handle = handle.unwrap();
        factory.emit(SignalingEvent::Session {
            handle,
            event: SessionEvent::Accepted,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        control.hangup().await.unwrap();

        for _ in 0..50 {
            if !store.submitted().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let records = store.submitted();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].extension, "1002");
    }
}
