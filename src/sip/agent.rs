//! Signaling agent
//!
//! Owns one transport and its registration lifecycle. Low-level events are
//! fanned out to exactly one bound listener; rebinding swaps the slot so
//! events are never delivered twice.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::config::Credentials;
use super::transport::{SignalingEvent, SignalingTransport, TransportFactory};
use super::SipError;

/// Registration status of the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "cause", rename_all = "snake_case")]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    Registered,
    RegistrationFailed(String),
}

impl RegistrationStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationStatus::Registered)
    }
}

/// Token returned by `bind_listeners`; unbinding needs the matching token
#[derive(Debug, PartialEq, Eq)]
pub struct ListenerBinding {
    id: u64,
}

struct ListenerSlot {
    id: u64,
    sender: mpsc::UnboundedSender<SignalingEvent>,
}

pub struct SignalingAgent {
    credentials: Credentials,
    transport: Arc<dyn SignalingTransport>,
    status: watch::Sender<RegistrationStatus>,
    listener: Mutex<Option<ListenerSlot>>,
    next_binding: AtomicU64,
    registering: AtomicBool,
    cancel_token: CancellationToken,
}

impl SignalingAgent {
    /// Build the transport for `credentials` and start pumping its events.
    ///
    /// Does not register; call `ensure_registered` for that.
    pub fn start(credentials: Credentials, factory: &dyn TransportFactory) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = factory.create(&credentials, event_tx);
        let (status, _) = watch::channel(RegistrationStatus::Unregistered);

        let agent = Arc::new(Self {
            credentials,
            transport,
            status,
            listener: Mutex::new(None),
            next_binding: AtomicU64::new(1),
            registering: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        });

        tokio::spawn(pump_events(
            Arc::downgrade(&agent),
            event_rx,
            agent.cancel_token.clone(),
        ));
        tracing::info!("Signaling agent started for extension {}", agent.credentials.extension);
        agent
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn transport(&self) -> Arc<dyn SignalingTransport> {
        self.transport.clone()
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RegistrationStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: RegistrationStatus) {
        self.status.send_replace(status);
    }

    /// Register unless already registered or a registration is in flight
    pub async fn ensure_registered(&self) -> Result<(), SipError> {
        match self.status() {
            RegistrationStatus::Registered | RegistrationStatus::Registering => Ok(()),
            _ => self.register().await,
        }
    }

    /// Register now; concurrent callers share the attempt already running
    pub async fn register(&self) -> Result<(), SipError> {
        if self
            .registering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        self.set_status(RegistrationStatus::Registering);
        let result = self.transport.register().await;
        match &result {
            Ok(()) => {
                tracing::info!("Extension {} registered", self.credentials.extension);
                self.set_status(RegistrationStatus::Registered);
            }
            Err(e) => {
                tracing::warn!("Extension {} registration failed: {}", self.credentials.extension, e);
                self.set_status(RegistrationStatus::RegistrationFailed(e.to_string()));
            }
        }
        self.registering.store(false, Ordering::SeqCst);
        result
    }

    /// Install `sender` as the only listener, replacing any previous one
    pub fn bind_listeners(&self, sender: mpsc::UnboundedSender<SignalingEvent>) -> ListenerBinding {
        let id = self.next_binding.fetch_add(1, Ordering::SeqCst);
        let previous = match self.listener.lock() {
            Ok(mut slot) => slot.replace(ListenerSlot { id, sender }),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            tracing::debug!("Listener {} replaced by {}", previous.id, id);
        }
        ListenerBinding { id }
    }

    /// Detach the listener if `binding` is still the current one
    pub fn unbind_listeners(&self, binding: &ListenerBinding) -> bool {
        let Ok(mut slot) = self.listener.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(current) if current.id == binding.id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Whether `binding` still owns the listener slot
    pub fn is_bound(&self, binding: &ListenerBinding) -> bool {
        self.listener
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|current| current.id == binding.id))
            .unwrap_or(false)
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn dispatch(&self, event: SignalingEvent) {
        match &event {
            SignalingEvent::Registered => self.set_status(RegistrationStatus::Registered),
            SignalingEvent::RegistrationFailed(cause) => {
                tracing::warn!("Registration lost: {}", cause);
                self.set_status(RegistrationStatus::RegistrationFailed(cause.clone()));
            }
            SignalingEvent::Unregistered => self.set_status(RegistrationStatus::Unregistered),
            _ => {}
        }

        let Ok(mut slot) = self.listener.lock() else {
            return;
        };
        let Some(current) = slot.as_ref() else {
            drop(slot);
            self.drop_unlistened(event);
            return;
        };
        if let Err(mpsc::error::SendError(event)) = current.sender.send(event) {
            // Receiver went away without unbinding
            *slot = None;
            drop(slot);
            self.drop_unlistened(event);
        }
    }

    fn drop_unlistened(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingCall { handle, from, .. } => {
                tracing::info!("No listener bound, declining call from {}", from);
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.reject(&handle).await {
                        tracing::debug!("Declining unattended call failed: {}", e);
                    }
                    transport.release(&handle).await;
                });
            }
            other => tracing::debug!("No listener bound, dropping {:?}", other),
        }
    }

    /// Hang up, unregister and stop pumping events
    pub async fn stop(&self) {
        tracing::info!("Stopping signaling agent for {}", self.credentials.extension);
        self.cancel_token.cancel();
        self.transport.shutdown().await;
        if let Ok(mut slot) = self.listener.lock() {
            *slot = None;
        }
        self.set_status(RegistrationStatus::Unregistered);
    }
}

impl Drop for SignalingAgent {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn pump_events(
    agent: Weak<SignalingAgent>,
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(agent) = agent.upgrade() else {
            break;
        };
        agent.dispatch(event);
    }
    tracing::debug!("Signaling event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalMedia;
    use crate::sip::{CallHandle, MediaTrack, SessionEvent, SessionState};

    struct StubTransport {
        fail_register: bool,
        registers: AtomicU64,
        rejected: Mutex<Vec<CallHandle>>,
    }

    #[async_trait::async_trait]
    impl SignalingTransport for StubTransport {
        async fn register(&self) -> Result<(), SipError> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            if self.fail_register {
                Err(SipError::RegistrationFailed("403 Forbidden".to_string()))
            } else {
                Ok(())
            }
        }
        async fn unregister(&self) -> Result<(), SipError> {
            Ok(())
        }
        async fn invite(&self, _: &CallHandle, _: &str, _: &LocalMedia) -> Result<(), SipError> {
            Ok(())
        }
        async fn answer(&self, _: &CallHandle, _: &LocalMedia) -> Result<(), SipError> {
            Ok(())
        }
        async fn reject(&self, handle: &CallHandle) -> Result<(), SipError> {
            self.rejected.lock().unwrap().push(handle.clone());
            Ok(())
        }
        async fn terminate(&self, _: &CallHandle) -> Result<(), SipError> {
            Ok(())
        }
        async fn set_hold(&self, _: &CallHandle, _: bool) -> Result<(), SipError> {
            Ok(())
        }
        fn session_state(&self, _: &CallHandle) -> SessionState {
            SessionState::Unknown
        }
        fn take_tracks(&self, _: &CallHandle) -> Vec<MediaTrack> {
            Vec::new()
        }
        async fn release(&self, _: &CallHandle) {}
        async fn shutdown(&self) {}
    }

    struct StubFactory {
        fail_register: bool,
        transport: Mutex<Option<Arc<StubTransport>>>,
        events: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    }

    impl StubFactory {
        fn new(fail_register: bool) -> Self {
            Self {
                fail_register,
                transport: Mutex::new(None),
                events: Mutex::new(None),
            }
        }

        fn transport(&self) -> Arc<StubTransport> {
            self.transport.lock().unwrap().clone().unwrap()
        }

        fn emit(&self, event: SignalingEvent) {
            self.events.lock().unwrap().as_ref().unwrap().send(event).unwrap();
        }
    }

    impl TransportFactory for StubFactory {
        fn create(
            &self,
            _: &Credentials,
            events: mpsc::UnboundedSender<SignalingEvent>,
        ) -> Arc<dyn SignalingTransport> {
            let transport = Arc::new(StubTransport {
                fail_register: self.fail_register,
                registers: AtomicU64::new(0),
                rejected: Mutex::new(Vec::new()),
            });
            *self.transport.lock().unwrap() = Some(transport.clone());
            *self.events.lock().unwrap() = Some(events);
            transport
        }
    }

    fn progress(handle: &CallHandle) -> SignalingEvent {
        SignalingEvent::Session {
            handle: handle.clone(),
            event: SessionEvent::Progress,
        }
    }

    #[tokio::test]
    async fn test_registration_success_and_reuse() {
        let factory = StubFactory::new(false);
        let agent = SignalingAgent::start(Credentials::new("1001", "pw"), &factory);

        agent.ensure_registered().await.unwrap();
        agent.ensure_registered().await.unwrap();

        assert_eq!(agent.status(), RegistrationStatus::Registered);
        assert_eq!(factory.transport().registers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_failure_is_retryable() {
        let factory = StubFactory::new(true);
        let agent = SignalingAgent::start(Credentials::new("1001", "pw"), &factory);

        assert!(agent.ensure_registered().await.is_err());
        assert!(matches!(
            agent.status(),
            RegistrationStatus::RegistrationFailed(ref cause) if cause.contains("403")
        ));

        assert!(agent.ensure_registered().await.is_err());
        assert_eq!(factory.transport().registers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rebind_replaces_listener() {
        let factory = StubFactory::new(false);
        let agent = SignalingAgent::start(Credentials::new("1001", "pw"), &factory);

        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let first = agent.bind_listeners(first_tx);
        let _second = agent.bind_listeners(second_tx);

        factory.emit(progress(&CallHandle::from("a")));
        let event = second_rx.recv().await.unwrap();
        assert!(matches!(event, SignalingEvent::Session { .. }));
        assert!(first_rx.try_recv().is_err());

        // A stale unbind from the first mount leaves the second in place
        assert!(!agent.unbind_listeners(&first));
        assert!(agent.has_listener());
    }

    #[tokio::test]
    async fn test_unbind_detaches_current_listener() {
        let factory = StubFactory::new(false);
        let agent = SignalingAgent::start(Credentials::new("1001", "pw"), &factory);

        let (tx, _rx) = mpsc::unbounded_channel();
        let binding = agent.bind_listeners(tx);
        assert!(agent.is_bound(&binding));
        assert!(agent.unbind_listeners(&binding));
        assert!(!agent.is_bound(&binding));
        assert!(!agent.has_listener());
        assert!(!agent.unbind_listeners(&binding));
    }

    #[tokio::test]
    async fn test_unattended_incoming_call_is_declined() {
        let factory = StubFactory::new(false);
        let _agent = SignalingAgent::start(Credentials::new("1001", "pw"), &factory);

        factory.emit(SignalingEvent::IncomingCall {
            handle: CallHandle::from("in-1"),
            from: "5550100".to_string(),
            display_name: None,
        });

        for _ in 0..50 {
            if !factory.transport().rejected.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            factory.transport().rejected.lock().unwrap().as_slice(),
            &[CallHandle::from("in-1")]
        );
    }

    #[tokio::test]
    async fn test_refresh_failure_event_updates_status() {
        let factory = StubFactory::new(false);
        let agent = SignalingAgent::start(Credentials::new("1001", "pw"), &factory);
        agent.ensure_registered().await.unwrap();

        let mut status = agent.subscribe_status();
        factory.emit(SignalingEvent::RegistrationFailed("timeout".to_string()));
        status.changed().await.unwrap();
        assert_eq!(
            *status.borrow(),
            RegistrationStatus::RegistrationFailed("timeout".to_string())
        );
    }
}
