//! SIP User Agent
//!
//! `SignalingTransport` backed by rsipstack: trunk registration with
//! periodic refresh, outbound INVITE, inbound INVITE handling and BYE.
//! Per-session state is kept in a small table so the call core can ask for
//! the authoritative `SessionState` at any time; entries live until the
//! call core releases them.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ftth_rsipstack::{
    dialog::{
        authenticate::Credential,
        client_dialog::ClientInviteDialog,
        dialog::{DialogState, DialogStateSender, TerminatedReason},
        dialog_layer::DialogLayer,
        invitation::InviteOption,
        registration::Registration,
        server_dialog::ServerInviteDialog,
        DialogId,
    },
    rsip::{self, prelude::HeadersExt},
    transaction::{endpoint::EndpointInnerRef, TransactionReceiver},
    transport::{udp::UdpConnection, SipAddr, TransportLayer},
    EndpointBuilder,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::{Credentials, SipCodec, SipConfig};
use super::rtp::RtpSession;
use super::transport::{
    CallHandle, ConnectivityState, EndReason, MediaTrack, SessionEvent, SessionState,
    SignalingEvent, SignalingTransport, TransportFactory,
};
use super::SipError;
use crate::media::LocalMedia;

/// How long a REGISTER may take before we give up
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds `RsipTransport`s for the agent
pub struct RsipTransportFactory {
    config: SipConfig,
}

impl RsipTransportFactory {
    pub fn new(config: SipConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for RsipTransportFactory {
    fn create(
        &self,
        credentials: &Credentials,
        events: UnboundedSender<SignalingEvent>,
    ) -> Arc<dyn SignalingTransport> {
        Arc::new(RsipTransport::new(
            self.config.clone(),
            credentials.clone(),
            events,
        ))
    }
}

/// A running endpoint with its registration
struct Stack {
    dialog_layer: Arc<DialogLayer>,
    registration: Arc<tokio::sync::Mutex<Registration>>,
    server_uri: rsip::Uri,
    local_ip: IpAddr,
    local_port: u16,
    credential: Credential,
    token: CancellationToken,
}

#[derive(Default)]
struct Session {
    state: Option<SessionState>,
    dialog_id: Option<DialogId>,
    client: Option<ClientInviteDialog>,
    server: Option<ServerInviteDialog>,
    rtp: Option<Arc<RtpSession>>,
    invite_task: Option<JoinHandle<()>>,
}

impl Session {
    fn state(&self) -> SessionState {
        self.state.clone().unwrap_or(SessionState::Pending)
    }

    fn is_ended(&self) -> bool {
        matches!(self.state, Some(SessionState::Ended(_)))
    }
}

/// Session table shared with the dialog tasks
struct Sessions {
    events: UnboundedSender<SignalingEvent>,
    table: Mutex<HashMap<CallHandle, Session>>,
    by_dialog: Mutex<HashMap<DialogId, CallHandle>>,
}

impl Sessions {
    fn with<R>(&self, handle: &CallHandle, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut table = self.table.lock().ok()?;
        table.get_mut(handle).map(f)
    }

    fn insert(&self, handle: CallHandle, session: Session) {
        if let Some(id) = session.dialog_id.clone() {
            self.bind_dialog(&handle, id);
        }
        if let Ok(mut table) = self.table.lock() {
            table.insert(handle, session);
        }
    }

    fn bind_dialog(&self, handle: &CallHandle, id: DialogId) {
        if let Ok(mut by_dialog) = self.by_dialog.lock() {
            by_dialog.insert(id.clone(), handle.clone());
        }
        self.with(handle, |s| s.dialog_id = Some(id));
    }

    fn handle_for(&self, id: &DialogId) -> Option<CallHandle> {
        self.by_dialog.lock().ok()?.get(id).cloned()
    }

    fn emit(&self, handle: &CallHandle, event: SessionEvent) {
        let _ = self.events.send(SignalingEvent::Session {
            handle: handle.clone(),
            event,
        });
    }

    fn progress(&self, handle: &CallHandle) {
        let changed = self
            .with(handle, |s| {
                if matches!(s.state(), SessionState::Pending | SessionState::Ringing) {
                    s.state = Some(SessionState::Ringing);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if changed {
            self.emit(handle, SessionEvent::Progress);
        }
    }

    /// Drop the entry and everything it holds
    fn remove(&self, handle: &CallHandle) -> bool {
        let removed = match self.table.lock() {
            Ok(mut table) => table.remove(handle),
            Err(_) => None,
        };
        if let Ok(mut by_dialog) = self.by_dialog.lock() {
            by_dialog.retain(|_, owner| owner != handle);
        }
        let Some(session) = removed else {
            return false;
        };
        if let Some(rtp) = &session.rtp {
            rtp.stop();
        }
        if let Some(task) = &session.invite_task {
            task.abort();
        }
        true
    }

    /// Mark the session answered and start its media, once
    async fn establish(self: &Arc<Self>, handle: &CallHandle, remote: Option<SocketAddr>) {
        let rtp = self
            .with(handle, |s| {
                if s.is_ended() || s.state() == SessionState::Established {
                    return None;
                }
                s.state = Some(SessionState::Established);
                Some(s.rtp.clone())
            })
            .flatten();
        let Some(rtp) = rtp else {
            return;
        };
        if let Some(rtp) = rtp {
            if let Some(addr) = remote {
                rtp.set_remote(addr).await;
            }
            rtp.start();

            let failure = rtp.receive_failure();
            let sessions = self.clone();
            let h = handle.clone();
            tokio::spawn(async move {
                if failure.await {
                    tracing::warn!("RTP path of session {} failed", h);
                    sessions.emit(&h, SessionEvent::Connectivity(ConnectivityState::Failed));
                }
            });
        }
        tracing::info!("SIP session {} established", handle);
        self.emit(handle, SessionEvent::Accepted);
    }

    /// Mark the session ended and publish the reason, once
    fn finish(&self, handle: &CallHandle, reason: EndReason) {
        let ended = self
            .with(handle, |s| {
                if s.is_ended() {
                    return false;
                }
                s.state = Some(SessionState::Ended(reason.clone()));
                if let Some(rtp) = &s.rtp {
                    rtp.stop();
                }
                true
            })
            .unwrap_or(false);
        if ended {
            tracing::info!("SIP session {} ended: {}", handle, reason.cause());
            self.emit(handle, SessionEvent::Ended(reason));
        }
    }
}

/// rsipstack-backed signaling transport for one extension
pub struct RsipTransport {
    config: SipConfig,
    credentials: Credentials,
    sessions: Arc<Sessions>,
    stack: tokio::sync::RwLock<Option<Arc<Stack>>>,
    cancel_token: CancellationToken,
}

impl RsipTransport {
    pub fn new(
        config: SipConfig,
        credentials: Credentials,
        events: UnboundedSender<SignalingEvent>,
    ) -> Self {
        Self {
            config,
            credentials,
            sessions: Arc::new(Sessions {
                events,
                table: Mutex::new(HashMap::new()),
                by_dialog: Mutex::new(HashMap::new()),
            }),
            stack: tokio::sync::RwLock::new(None),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the first non-loopback IPv4 address
    fn local_ipv4(&self) -> Result<IpAddr, SipError> {
        if let Some(ip) = &self.config.local_ip {
            return ip
                .parse()
                .map_err(|e| SipError::Transport(format!("Invalid SIP_LOCAL_IP: {}", e)));
        }
        for iface in get_if_addrs::get_if_addrs().map_err(|e| SipError::Transport(e.to_string()))? {
            if !iface.is_loopback() {
                if let get_if_addrs::IfAddr::V4(ref addr) = iface.addr {
                    return Ok(IpAddr::V4(addr.ip));
                }
            }
        }
        Err(SipError::Transport("No IPv4 interface found".to_string()))
    }

    async fn running_stack(&self) -> Result<Arc<Stack>, SipError> {
        self.stack.read().await.clone().ok_or(SipError::NotRegistered)
    }

    /// Bring up transport, endpoint and the inbound request loop
    async fn build_stack(&self) -> Result<Arc<Stack>, SipError> {
        let local_ip = self.local_ipv4()?;

        let trunk_addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        let server_ip = tokio::net::lookup_host(&trunk_addr)
            .await
            .map_err(|e| SipError::Transport(format!("DNS resolution failed: {}", e)))?
            .next()
            .ok_or_else(|| SipError::Transport("No addresses found for SIP server".to_string()))?;
        tracing::info!(
            "SIP server {} resolved to {}, local IP {}",
            self.config.server_host,
            server_ip,
            local_ip
        );

        let token = self.cancel_token.child_token();
        let mut transport_layer = TransportLayer::new(token.clone());
        // Domain stays in the headers, packets go to the resolved address
        transport_layer.outbound = Some(SipAddr::from(server_ip));

        let local_port = 15060 + (rand::random::<u16>() % 1000);
        let connection = UdpConnection::create_connection(
            SocketAddr::new(local_ip, local_port),
            None,
            Some(token.child_token()),
        )
        .await
        .map_err(|e| SipError::Transport(format!("I/O error: {}", e)))?;
        transport_layer.add_transport(connection.into());

        let endpoint = EndpointBuilder::new()
            .with_cancel_token(token.clone())
            .with_transport_layer(transport_layer)
            .build();

        let credential = Credential {
            username: self.credentials.extension.clone(),
            password: self.credentials.secret.clone(),
            realm: Some(self.config.domain.clone()),
        };
        let server_uri = rsip::Uri::try_from(self.config.registrar_uri())
            .map_err(|e| SipError::RegistrationFailed(format!("Invalid SIP URI: {:?}", e)))?;

        let endpoint_inner: EndpointInnerRef = endpoint.inner.clone();
        let dialog_layer = Arc::new(DialogLayer::new(endpoint_inner.clone()));
        let registration = Registration::new(endpoint_inner, Some(credential.clone()));
        let incoming = endpoint
            .incoming_transactions()
            .map_err(|e| SipError::Transport(format!("Incoming transactions: {:?}", e)))?;

        tokio::spawn(async move {
            endpoint.serve().await;
            tracing::info!("SIP endpoint finished");
        });

        let (state_tx, state_rx) = unbounded_channel();
        tokio::spawn(serve_incoming(
            self.sessions.clone(),
            dialog_layer.clone(),
            incoming,
            state_tx,
            token.clone(),
        ));
        tokio::spawn(watch_server_dialogs(self.sessions.clone(), state_rx, token.clone()));

        Ok(Arc::new(Stack {
            dialog_layer,
            registration: Arc::new(tokio::sync::Mutex::new(registration)),
            server_uri,
            local_ip,
            local_port,
            credential,
            token,
        }))
    }

    /// Re-register at 75% of the granted expiry until cancelled
    fn spawn_refresh(&self, stack: &Arc<Stack>, expires: u32) {
        let registration = stack.registration.clone();
        let server_uri = stack.server_uri.clone();
        let token = stack.token.clone();
        let events = self.sessions.events.clone();
        let requested = self.config.register_expires;

        tokio::spawn(async move {
            let mut expires = expires;
            loop {
                let refresh = (expires as u64 * 3 / 4).max(30);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(refresh)) => {}
                }

                let mut registration = registration.lock().await;
                match registration.register(server_uri.clone(), Some(requested)).await {
                    Ok(resp) if resp.status_code == rsip::StatusCode::OK => {
                        expires = registration.expires();
                        tracing::debug!("SIP re-registration successful");
                    }
                    Ok(resp) => {
                        tracing::warn!("SIP re-registration failed: {:?}", resp.status_code);
                        let _ = events.send(SignalingEvent::RegistrationFailed(format!(
                            "Re-registration failed: {:?}",
                            resp.status_code
                        )));
                        break;
                    }
                    Err(e) => {
                        tracing::error!("SIP re-registration error: {:?}", e);
                        let _ = events.send(SignalingEvent::RegistrationFailed(format!(
                            "Re-registration error: {:?}",
                            e
                        )));
                        break;
                    }
                }
            }
        });
    }

    fn sdp(&self, local_ip: IpAddr, rtp_port: u16) -> String {
        sdp_body(&local_ip.to_string(), rtp_port, self.config.codec)
    }
}

#[async_trait::async_trait]
impl SignalingTransport for RsipTransport {
    async fn register(&self) -> Result<(), SipError> {
        let stack = {
            let mut slot = self.stack.write().await;
            match slot.as_ref() {
                Some(stack) => stack.clone(),
                None => {
                    let stack = self.build_stack().await?;
                    *slot = Some(stack.clone());
                    stack
                }
            }
        };

        tracing::info!("Attempting SIP REGISTER to {}", stack.server_uri);
        let mut registration = stack.registration.lock().await;
        let response = tokio::time::timeout(
            REGISTER_TIMEOUT,
            registration.register(stack.server_uri.clone(), Some(self.config.register_expires)),
        )
        .await
        .map_err(|_| SipError::Timeout("Registration timed out after 10 seconds".to_string()))?
        .map_err(|e| SipError::RegistrationFailed(format!("Registration error: {:?}", e)))?;

        if response.status_code != rsip::StatusCode::OK {
            return Err(SipError::RegistrationFailed(format!(
                "Registration failed: {:?}",
                response.status_code
            )));
        }

        let expires = registration.expires();
        drop(registration);
        tracing::info!("SIP registration successful, expires in {} seconds", expires);
        self.spawn_refresh(&stack, expires);
        Ok(())
    }

    async fn unregister(&self) -> Result<(), SipError> {
        let Some(stack) = self.stack.write().await.take() else {
            return Ok(());
        };
        let result = {
            let mut registration = stack.registration.lock().await;
            tokio::time::timeout(
                REGISTER_TIMEOUT,
                registration.register(stack.server_uri.clone(), Some(0)),
            )
            .await
        };
        stack.token.cancel();
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SipError::RegistrationFailed(format!("Unregister error: {:?}", e))),
            Err(_) => Err(SipError::Timeout("Unregister timed out".to_string())),
        }
    }

    async fn invite(
        &self,
        handle: &CallHandle,
        target: &str,
        media: &LocalMedia,
    ) -> Result<(), SipError> {
        let stack = self.running_stack().await?;
        let rtp = media
            .rtp()
            .ok_or_else(|| SipError::InvalidState("No RTP session for call".to_string()))?;

        let caller = self.config.aor(&self.credentials.extension);
        let callee = self.config.target_uri(target);
        let contact = self.config.contact_uri(
            &self.credentials.extension,
            &stack.local_ip.to_string(),
            stack.local_port,
        );
        tracing::info!("Dialing: {} -> {}", caller, callee);

        let invite_option = InviteOption {
            caller: caller
                .as_str()
                .try_into()
                .map_err(|e| SipError::CallFailed(format!("Invalid caller URI: {:?}", e)))?,
            callee: callee
                .as_str()
                .try_into()
                .map_err(|e| SipError::CallFailed(format!("Invalid callee URI: {:?}", e)))?,
            content_type: Some("application/sdp".to_string()),
            destination: None,
            offer: Some(self.sdp(stack.local_ip, rtp.local_port()).into_bytes()),
            contact: contact
                .as_str()
                .try_into()
                .map_err(|e| SipError::CallFailed(format!("Invalid contact URI: {:?}", e)))?,
            credential: Some(stack.credential.clone()),
            headers: None,
        };

        self.sessions.insert(
            handle.clone(),
            Session {
                rtp: Some(rtp),
                ..Default::default()
            },
        );

        let (state_tx, mut state_rx) = unbounded_channel();

        let sessions = self.sessions.clone();
        let h = handle.clone();
        tokio::spawn(async move {
            while let Some(dialog_state) = state_rx.recv().await {
                match dialog_state {
                    DialogState::Calling(id) => sessions.bind_dialog(&h, id),
                    DialogState::Trying(_) => tracing::debug!("Call {} - Trying (100)", h),
                    DialogState::Early(_, ref resp) => {
                        tracing::info!("Call {} - Early response: {}", h, resp.status_code.code());
                        sessions.progress(&h);
                    }
                    DialogState::Confirmed(_, _) => {
                        sessions.emit(&h, SessionEvent::Confirmed);
                    }
                    DialogState::Terminated(_, reason) => {
                        sessions.finish(&h, end_reason(&reason));
                        break;
                    }
                    _ => {}
                }
            }
        });

        let sessions = self.sessions.clone();
        let dialog_layer = stack.dialog_layer.clone();
        let h = handle.clone();
        let task = tokio::spawn(async move {
            // Resolves on the final response; provisionals arrive on the state channel
            match dialog_layer.do_invite(invite_option, state_tx).await {
                Ok((dialog, Some(resp))) => {
                    let status = resp.status_code.code();
                    if (200..300).contains(&status) {
                        let id = dialog.id();
                        sessions.with(&h, |s| s.client = Some(dialog));
                        sessions.bind_dialog(&h, id);
                        sessions.establish(&h, remote_media_addr(&resp.body)).await;
                    } else {
                        tracing::warn!("Call {} failed with {}", h, status);
                        sessions.finish(&h, EndReason::Rejected(status));
                    }
                }
                Ok((_, None)) => {
                    sessions.finish(&h, EndReason::Failed("no final response".to_string()));
                }
                Err(e) => {
                    tracing::error!("Call {} INVITE error: {:?}", h, e);
                    sessions.finish(&h, EndReason::Failed(format!("{:?}", e)));
                }
            }
        });
        self.sessions.with(handle, |s| s.invite_task = Some(task));
        Ok(())
    }

    async fn answer(&self, handle: &CallHandle, media: &LocalMedia) -> Result<(), SipError> {
        let stack = self.running_stack().await?;
        let rtp = media
            .rtp()
            .ok_or_else(|| SipError::InvalidState("No RTP session for call".to_string()))?;
        let server = self
            .sessions
            .with(handle, |s| {
                s.rtp = Some(rtp.clone());
                s.server.clone()
            })
            .flatten()
            .ok_or_else(|| SipError::CallNotFound(handle.to_string()))?;

        let offer = server.initial_request().body.clone();
        let headers = vec![rsip::Header::ContentType("application/sdp".to_string().into())];
        server
            .accept(
                Some(headers),
                Some(self.sdp(stack.local_ip, rtp.local_port()).into_bytes()),
            )
            .map_err(|e| SipError::CallFailed(format!("Failed to accept call: {:?}", e)))?;

        self.sessions.establish(handle, remote_media_addr(&offer)).await;
        Ok(())
    }

    async fn reject(&self, handle: &CallHandle) -> Result<(), SipError> {
        let server = self
            .sessions
            .with(handle, |s| s.server.clone())
            .flatten()
            .ok_or_else(|| SipError::CallNotFound(handle.to_string()))?;
        server
            .reject(Some(rsip::StatusCode::BusyHere), None)
            .map_err(|e| SipError::CallFailed(format!("Failed to reject call: {:?}", e)))?;
        self.sessions.finish(handle, EndReason::Rejected(486));
        Ok(())
    }

    async fn terminate(&self, handle: &CallHandle) -> Result<(), SipError> {
        let snapshot = self.sessions.with(handle, |s| {
            (
                s.state(),
                s.client.clone(),
                s.server.clone(),
                s.dialog_id.clone(),
                s.invite_task.take(),
            )
        });
        let Some((state, client, server, dialog_id, invite_task)) = snapshot else {
            return Err(SipError::CallNotFound(handle.to_string()));
        };

        match state {
            SessionState::Ended(_) => return Ok(()),
            SessionState::Established => {
                if let Some(client) = client {
                    client
                        .bye()
                        .await
                        .map_err(|e| SipError::CallFailed(format!("BYE failed: {:?}", e)))?;
                } else if let Some(server) = server {
                    server
                        .bye()
                        .await
                        .map_err(|e| SipError::CallFailed(format!("BYE failed: {:?}", e)))?;
                }
                self.sessions.finish(handle, EndReason::Bye);
            }
            _ => {
                if let Some(server) = server {
                    server
                        .reject(Some(rsip::StatusCode::RequestTerminated), None)
                        .map_err(|e| SipError::CallFailed(format!("Failed to reject: {:?}", e)))?;
                } else if let Some(id) = dialog_id {
                    if let Ok(stack) = self.running_stack().await {
                        if let Some(dialog) = stack.dialog_layer.get_dialog(&id) {
                            let _ = dialog.hangup().await;
                        }
                    }
                }
                if let Some(task) = invite_task {
                    task.abort();
                }
                self.sessions.finish(handle, EndReason::Cancelled);
            }
        }
        Ok(())
    }

    async fn set_hold(&self, handle: &CallHandle, on_hold: bool) -> Result<(), SipError> {
        let rtp = self
            .sessions
            .with(handle, |s| s.rtp.clone())
            .flatten()
            .ok_or_else(|| SipError::CallNotFound(handle.to_string()))?;
        rtp.set_on_hold(on_hold);
        Ok(())
    }

    fn session_state(&self, handle: &CallHandle) -> SessionState {
        self.sessions
            .with(handle, |s| s.state())
            .unwrap_or(SessionState::Unknown)
    }

    fn take_tracks(&self, handle: &CallHandle) -> Vec<MediaTrack> {
        self.sessions
            .with(handle, |s| s.rtp.clone())
            .flatten()
            .map(|rtp| rtp.take_tracks(handle.as_str()))
            .unwrap_or_default()
    }

    async fn release(&self, handle: &CallHandle) {
        let Some(ended) = self.sessions.with(handle, |s| s.is_ended()) else {
            return;
        };
        if !ended {
            if let Err(e) = self.terminate(handle).await {
                tracing::debug!("Tearing down session {} on release failed: {}", handle, e);
            }
        }
        if self.sessions.remove(handle) {
            tracing::debug!("SIP session {} released", handle);
        }
    }

    async fn shutdown(&self) {
        let handles: Vec<CallHandle> = match self.sessions.table.lock() {
            Ok(table) => table.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            self.release(&handle).await;
        }
        if let Err(e) = self.unregister().await {
            tracing::warn!("SIP unregister during shutdown failed: {}", e);
        }
        self.cancel_token.cancel();
    }
}

impl Drop for RsipTransport {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Route incoming transactions: in-dialog requests to their dialog, new
/// INVITEs to a fresh server dialog
async fn serve_incoming(
    sessions: Arc<Sessions>,
    dialog_layer: Arc<DialogLayer>,
    mut incoming: TransactionReceiver,
    state_tx: DialogStateSender,
    token: CancellationToken,
) {
    loop {
        let mut tx = tokio::select! {
            _ = token.cancelled() => break,
            tx = incoming.recv() => match tx {
                Some(tx) => tx,
                None => break,
            },
        };

        let in_dialog = tx
            .original
            .to_header()
            .ok()
            .and_then(|h| h.tag().ok().flatten())
            .is_some();
        if in_dialog {
            match dialog_layer.match_dialog(&tx.original) {
                Some(mut dialog) => {
                    tokio::spawn(async move {
                        if let Err(e) = dialog.handle(&mut tx).await {
                            tracing::debug!("In-dialog request failed: {:?}", e);
                        }
                    });
                }
                None => {
                    let _ = tx.reply(rsip::StatusCode::CallTransactionDoesNotExist).await;
                }
            }
            continue;
        }

        if tx.original.method != rsip::Method::Invite {
            let _ = tx.reply(rsip::StatusCode::OK).await;
            continue;
        }

        let mut dialog =
            match dialog_layer.get_or_create_server_invite(&tx, state_tx.clone(), None, None) {
                Ok(dialog) => dialog,
                Err(e) => {
                    tracing::warn!("Failed to create server dialog: {:?}", e);
                    let _ = tx.reply(rsip::StatusCode::CallTransactionDoesNotExist).await;
                    continue;
                }
            };

        let (from, display_name) = match tx.original.from_header() {
            Ok(header) => (
                header
                    .uri()
                    .ok()
                    .and_then(|uri| uri.user().map(|u| u.to_string()))
                    .unwrap_or_default(),
                header.display_name().ok().flatten(),
            ),
            Err(_) => (String::new(), None),
        };

        let handle = CallHandle::new();
        sessions.insert(
            handle.clone(),
            Session {
                state: Some(SessionState::Ringing),
                dialog_id: Some(dialog.id()),
                server: Some(dialog.clone()),
                ..Default::default()
            },
        );
        tracing::info!("Incoming SIP call {} from {}", handle, from);
        let _ = sessions.events.send(SignalingEvent::IncomingCall {
            handle,
            from,
            display_name,
        });

        tokio::spawn(async move {
            if let Err(e) = dialog.handle(&mut tx).await {
                tracing::debug!("Server dialog ended with error: {:?}", e);
            }
        });
    }
}

/// Turn server-dialog state changes into session events
async fn watch_server_dialogs(
    sessions: Arc<Sessions>,
    mut states: tokio::sync::mpsc::UnboundedReceiver<DialogState>,
    token: CancellationToken,
) {
    loop {
        let state = tokio::select! {
            _ = token.cancelled() => break,
            state = states.recv() => match state {
                Some(state) => state,
                None => break,
            },
        };
        match state {
            DialogState::Confirmed(id, _) => {
                if let Some(handle) = sessions.handle_for(&id) {
                    sessions.emit(&handle, SessionEvent::Confirmed);
                }
            }
            DialogState::Terminated(id, reason) => {
                if let Some(handle) = sessions.handle_for(&id) {
                    sessions.finish(&handle, end_reason(&reason));
                }
            }
            _ => {}
        }
    }
}

fn end_reason(reason: &TerminatedReason) -> EndReason {
    match reason {
        TerminatedReason::UacBye | TerminatedReason::UasBye => EndReason::Bye,
        TerminatedReason::UacCancel => EndReason::Cancelled,
        TerminatedReason::UacBusy | TerminatedReason::UasBusy => EndReason::Rejected(486),
        TerminatedReason::UasDecline => EndReason::Rejected(603),
        TerminatedReason::ProxyAuthRequired => EndReason::Rejected(407),
        TerminatedReason::ProxyError(code)
        | TerminatedReason::UacOther(code)
        | TerminatedReason::UasOther(code) => EndReason::Rejected(code.code()),
        TerminatedReason::Timeout => EndReason::Terminated("timeout".to_string()),
    }
}

/// SDP body for our side of the call
fn sdp_body(local_ip: &str, rtp_port: u16, codec: SipCodec) -> String {
    let session_id = rand::random::<u32>();
    format!(
        "v=0\r\n\
         o=- {} 1 IN IP4 {}\r\n\
         s=VoIP Softphone Call\r\n\
         c=IN IP4 {}\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP {} 101\r\n\
         a=rtpmap:{} {}/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n",
        session_id,
        local_ip,
        local_ip,
        rtp_port,
        codec.payload_type(),
        codec.payload_type(),
        codec.sdp_name()
    )
}

/// Remote RTP address from an SDP body (`c=` line plus audio `m=` port)
fn remote_media_addr(sdp: &[u8]) -> Option<SocketAddr> {
    let text = std::str::from_utf8(sdp).ok()?;
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            ip = ip.or_else(|| rest.split_whitespace().next()?.parse().ok());
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            port = port.or_else(|| rest.split_whitespace().next()?.parse().ok());
        }
    }
    Some(SocketAddr::new(ip?, port?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::G711Codec;

    #[test]
    fn test_sdp_body_advertises_codec_and_port() {
        let sdp = sdp_body("10.0.0.2", 20002, SipCodec::Pcma);
        assert!(sdp.contains("c=IN IP4 10.0.0.2\r\n"));
        assert!(sdp.contains("m=audio 20002 RTP/AVP 8 101\r\n"));
        assert!(sdp.contains("a=rtpmap:8 PCMA/8000\r\n"));
    }

    #[test]
    fn test_remote_media_addr_parses_answer() {
        let sdp = b"v=0\r\no=- 1 1 IN IP4 203.0.113.5\r\ns=-\r\nc=IN IP4 203.0.113.9\r\nt=0 0\r\nm=audio 31000 RTP/AVP 0\r\n";
        assert_eq!(
            remote_media_addr(sdp),
            Some("203.0.113.9:31000".parse().unwrap())
        );
    }

    #[test]
    fn test_remote_media_addr_needs_both_parts() {
        assert_eq!(remote_media_addr(b"v=0\r\nm=audio 31000 RTP/AVP 0\r\n"), None);
        assert_eq!(remote_media_addr(b"\xff\xfe"), None);
    }

    #[test]
    fn test_end_reason_mapping() {
        assert_eq!(end_reason(&TerminatedReason::UasBye), EndReason::Bye);
        assert_eq!(end_reason(&TerminatedReason::UacCancel), EndReason::Cancelled);
        assert_eq!(end_reason(&TerminatedReason::UasBusy), EndReason::Rejected(486));
        assert_eq!(end_reason(&TerminatedReason::UasDecline), EndReason::Rejected(603));
        assert_eq!(
            end_reason(&TerminatedReason::UasOther(rsip::StatusCode::ServerInternalError)),
            EndReason::Rejected(500)
        );
        assert_eq!(
            end_reason(&TerminatedReason::Timeout),
            EndReason::Terminated("timeout".to_string())
        );
    }

    #[tokio::test]
    async fn test_unregistered_transport_refuses_calls() {
        let (tx, _rx) = unbounded_channel();
        let transport = RsipTransport::new(
            SipConfig {
                server_host: "pbx.example.com".to_string(),
                ..Default::default()
            },
            Credentials::new("1001", "pw"),
            tx,
        );
        let handle = CallHandle::new();
        let result = transport.invite(&handle, "5551234", &LocalMedia::detached()).await;
        assert!(matches!(result, Err(SipError::NotRegistered)));
        assert_eq!(transport.session_state(&handle), SessionState::Unknown);
        assert!(transport.take_tracks(&handle).is_empty());
        transport.release(&handle).await;
    }

    #[tokio::test]
    async fn test_release_frees_ended_session_and_its_port() {
        let (tx, _rx) = unbounded_channel();
        let transport = RsipTransport::new(
            SipConfig {
                server_host: "pbx.example.com".to_string(),
                ..Default::default()
            },
            Credentials::new("1001", "pw"),
            tx,
        );
        let rtp = Arc::new(RtpSession::bind(0, G711Codec::pcmu()).await.unwrap());
        let port = rtp.local_port();
        let handle = CallHandle::from("out-1");
        transport.sessions.insert(
            handle.clone(),
            Session {
                rtp: Some(rtp),
                ..Default::default()
            },
        );
        transport.sessions.finish(&handle, EndReason::Bye);
        assert_eq!(
            transport.session_state(&handle),
            SessionState::Ended(EndReason::Bye)
        );

        transport.release(&handle).await;
        assert_eq!(transport.session_state(&handle), SessionState::Unknown);
        assert!(transport.sessions.table.lock().unwrap().is_empty());
        // The socket went with the session
        assert!(std::net::UdpSocket::bind(("0.0.0.0", port)).is_ok());
    }

    #[tokio::test]
    async fn test_release_tears_down_unfinished_session() {
        let (tx, mut rx) = unbounded_channel();
        let transport = RsipTransport::new(
            SipConfig {
                server_host: "pbx.example.com".to_string(),
                ..Default::default()
            },
            Credentials::new("1001", "pw"),
            tx,
        );
        let handle = CallHandle::from("out-2");
        transport.sessions.insert(handle.clone(), Session::default());

        transport.release(&handle).await;
        assert_eq!(transport.session_state(&handle), SessionState::Unknown);
        match rx.try_recv() {
            Ok(SignalingEvent::Session {
                event: SessionEvent::Ended(EndReason::Cancelled),
                ..
            }) => {}
            other => panic!("expected a cancelled session, got {:?}", other),
        }
    }
}
