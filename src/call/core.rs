//! The call core actor
//!
//! `CallCore` is the single owner of call state. Everything that can change
//! a call is an input on its queue: user commands, transport events, timer
//! expirations and the completions of operations it spawned (media
//! acquisition, invite/answer/terminate). Inputs carry the handle of the
//! call they were issued for; anything addressed to a call that is no
//! longer active is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{
    normalize_target, Call, CallState, CallTimers, Clock, CommandError, Direction, TerminalState,
};
use crate::cdr::{CallDetailRecord, Finalizer};
use crate::config::CoreConfig;
use crate::media::{
    AudioMixer, LocalMedia, MediaDevices, MediaError, RecorderState, RecordingSession,
};
use crate::sip::{
    CallHandle, ConnectivityState, EndReason, ListenerBinding, MediaTrack, RegistrationStatus,
    SessionEvent, SessionState, SignalingAgent, SignalingEvent, SignalingTransport, SipError,
};

const DURATION_TICK: Duration = Duration::from_secs(1);

/// What the presentation layer renders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhoneStatus {
    pub state: CallState,
    pub registration: RegistrationStatus,
    pub peer: Option<String>,
    pub peer_display_name: Option<String>,
    pub direction: Option<Direction>,
    /// Only while established
    pub elapsed_seconds: Option<i64>,
    pub muted: bool,
    pub held: bool,
    pub cause: Option<String>,
    pub last_record: Option<CallDetailRecord>,
}

impl PhoneStatus {
    fn idle(registration: RegistrationStatus, last_record: Option<CallDetailRecord>) -> Self {
        Self {
            state: CallState::Idle,
            registration,
            peer: None,
            peer_display_name: None,
            direction: None,
            elapsed_seconds: None,
            muted: false,
            held: false,
            cause: None,
            last_record,
        }
    }
}

/// Collaborators of one call core
pub struct CoreDeps {
    pub agent: Arc<SignalingAgent>,
    pub media: Arc<dyn MediaDevices>,
    pub finalizer: Arc<Finalizer>,
    pub config: CoreConfig,
}

/// A presentation command, answered through a oneshot
#[derive(Debug)]
enum Command {
    Dial(String),
    Redial,
    Accept,
    Reject,
    Hangup,
    ToggleMute,
    ToggleHold,
    /// Take the agent's listener slot back
    Rebind,
}

/// Transport operation whose completion is posted back to the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingOp {
    Invite,
    Answer,
    Reject,
    Terminate,
    Hold(bool),
}

/// What a media acquisition was started for
#[derive(Debug)]
enum MediaPurpose {
    Dial { target: String },
    Answer,
}

/// Everything queued to the core besides transport events
enum ControlInput {
    Command(Command, oneshot::Sender<Result<(), CommandError>>),
    RingingExpired {
        handle: CallHandle,
        generation: u64,
    },
    DurationTick {
        handle: CallHandle,
        generation: u64,
    },
    MediaAcquired {
        handle: CallHandle,
        purpose: MediaPurpose,
        result: Result<LocalMedia, MediaError>,
    },
    SignalingDone {
        handle: CallHandle,
        op: SignalingOp,
        result: Result<(), SipError>,
    },
}

/// Why the run loop woke up
enum Wake {
    Input(ControlInput),
    Signal(SignalingEvent),
    Registration,
    Reconcile,
    Finalized(Result<CallDetailRecord, JoinError>),
    Stop,
}

/// Cloneable command handle to a running call core
#[derive(Clone)]
pub struct CallControl {
    inputs: mpsc::UnboundedSender<ControlInput>,
    status: watch::Receiver<PhoneStatus>,
    audio: watch::Receiver<Option<mpsc::Sender<Vec<i16>>>>,
    stopped: watch::Receiver<bool>,
    cancel_token: CancellationToken,
}

impl CallControl {
    async fn command(&self, command: Command) -> Result<(), CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inputs
            .send(ControlInput::Command(command, reply_tx))
            .map_err(|_| CommandError::Stopped)?;
        reply_rx.await.map_err(|_| CommandError::Stopped)?
    }

    /// Dial free-text input; only its digits are used
    pub async fn dial(&self, peer: &str) -> Result<(), CommandError> {
        self.command(Command::Dial(peer.to_string())).await
    }

    pub async fn redial(&self) -> Result<(), CommandError> {
        self.command(Command::Redial).await
    }

    pub async fn accept(&self) -> Result<(), CommandError> {
        self.command(Command::Accept).await
    }

    pub async fn reject(&self) -> Result<(), CommandError> {
        self.command(Command::Reject).await
    }

    pub async fn hangup(&self) -> Result<(), CommandError> {
        self.command(Command::Hangup).await
    }

    pub async fn toggle_mute(&self) -> Result<(), CommandError> {
        self.command(Command::ToggleMute).await
    }

    pub async fn toggle_hold(&self) -> Result<(), CommandError> {
        self.command(Command::ToggleHold).await
    }

    /// Re-install this core as the agent's listener if something else took
    /// the slot
    pub async fn rebind(&self) -> Result<(), CommandError> {
        self.command(Command::Rebind).await
    }

    pub fn status(&self) -> PhoneStatus {
        self.status.borrow().clone()
    }

    /// Sink for microphone frames (8kHz mono PCM) of the established call
    pub fn audio_input(&self) -> Option<mpsc::Sender<Vec<i16>>> {
        self.audio.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PhoneStatus> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        !*self.stopped.borrow()
    }

    /// Hang up, wait for pending finalizations and stop the core
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let mut stopped = self.stopped.clone();
        while !*stopped.borrow_and_update() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
    }
}

struct ActiveCall {
    call: Call,
    media: Option<LocalMedia>,
    recorder: RecordingSession,
    /// Tracks announced before the call was established
    pending_tracks: Vec<MediaTrack>,
    answering: bool,
}

impl ActiveCall {
    fn new(call: Call, recorder: RecordingSession) -> Self {
        Self {
            call,
            media: None,
            recorder,
            pending_tracks: Vec::new(),
            answering: false,
        }
    }

    fn feed_recorder(&mut self, tracks: Vec<MediaTrack>) {
        if self.recorder.state() == RecorderState::Recording {
            for track in tracks {
                self.recorder.add_track(track);
            }
            return;
        }
        if let Err(e) = self.recorder.start(tracks) {
            tracing::warn!("Recorder for call {} not started: {}", self.call.handle, e);
        }
    }
}

pub struct CallCore {
    agent: Arc<SignalingAgent>,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaDevices>,
    finalizer: Arc<Finalizer>,
    config: CoreConfig,
    clock: Clock,
    inputs_tx: mpsc::UnboundedSender<ControlInput>,
    signals_tx: mpsc::UnboundedSender<SignalingEvent>,
    binding: Option<ListenerBinding>,
    active: Option<ActiveCall>,
    timers: CallTimers,
    displayed: CallState,
    registration: RegistrationStatus,
    last_peer: Option<String>,
    last_record: Option<CallDetailRecord>,
    status: watch::Sender<PhoneStatus>,
    audio: watch::Sender<Option<mpsc::Sender<Vec<i16>>>>,
    finalizing: JoinSet<CallDetailRecord>,
}

impl CallCore {
    /// Bind a new core to `deps.agent` and run it
    pub fn spawn(deps: CoreDeps) -> (CallControl, JoinHandle<()>) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let cancel_token = CancellationToken::new();

        let mut core = Self::new(deps, inputs_tx.clone(), signals_tx);
        core.bind_listener();
        let control = CallControl {
            inputs: inputs_tx,
            status: core.status.subscribe(),
            audio: core.audio.subscribe(),
            stopped: stopped_rx,
            cancel_token: cancel_token.clone(),
        };

        let task = tokio::spawn(async move {
            core.run(inputs_rx, signals_rx, cancel_token).await;
            stopped_tx.send_replace(true);
        });
        (control, task)
    }

    fn new(
        deps: CoreDeps,
        inputs_tx: mpsc::UnboundedSender<ControlInput>,
        signals_tx: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        let registration = deps.agent.status();
        let (status, _) = watch::channel(PhoneStatus::idle(registration.clone(), None));
        let (audio, _) = watch::channel(None);
        Self {
            transport: deps.agent.transport(),
            agent: deps.agent,
            media: deps.media,
            finalizer: deps.finalizer,
            config: deps.config,
            clock: Clock::new(),
            inputs_tx,
            signals_tx,
            binding: None,
            active: None,
            timers: CallTimers::new(),
            displayed: CallState::Idle,
            registration,
            last_peer: None,
            last_record: None,
            status,
            audio,
            finalizing: JoinSet::new(),
        }
    }

    /// Own the agent's listener slot, taking it back if it was replaced
    fn bind_listener(&mut self) {
        if let Some(binding) = &self.binding {
            if self.agent.is_bound(binding) {
                return;
            }
            tracing::info!("Listener slot was taken over, rebinding call core");
        }
        self.binding = Some(self.agent.bind_listeners(self.signals_tx.clone()));
    }

    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<ControlInput>,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
        cancel_token: CancellationToken,
    ) {
        let mut registration = self.agent.subscribe_status();
        let period = self.config.reconcile_interval;
        let mut reconcile = interval_at(Instant::now() + period, period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!("Call core started");
        loop {
            let wake = tokio::select! {
                _ = cancel_token.cancelled() => Wake::Stop,
                input = inputs.recv() => match input {
                    Some(input) => Wake::Input(input),
                    None => Wake::Stop,
                },
                // The core holds a sender itself, so this never closes
                Some(event) = signals.recv() => Wake::Signal(event),
                Ok(()) = registration.changed() => Wake::Registration,
                _ = reconcile.tick() => Wake::Reconcile,
                Some(done) = self.finalizing.join_next() => Wake::Finalized(done),
            };

            match wake {
                Wake::Input(input) => self.handle_input(input),
                Wake::Signal(event) => self.handle_signal(event),
                Wake::Registration => {
                    self.registration = registration.borrow_and_update().clone();
                    self.publish();
                }
                Wake::Reconcile => self.reconcile(),
                Wake::Finalized(done) => self.finalized(done),
                Wake::Stop => break,
            }
        }

        self.shutdown().await;
        if let Some(binding) = self.binding.take() {
            self.agent.unbind_listeners(&binding);
        }
        tracing::debug!("Call core stopped");
    }

    async fn shutdown(&mut self) {
        let signaled = self
            .active
            .as_ref()
            .filter(|active| active.call.signaled)
            .map(|active| active.call.handle.clone());
        if let Some(handle) = signaled {
            if let Err(e) = self.transport.terminate(&handle).await {
                tracing::warn!("Hanging up call {} on shutdown failed: {}", handle, e);
            }
        }
        self.finish_call(TerminalState::Ended, "shutdown");

        while let Some(done) = self.finalizing.join_next().await {
            self.finalized(done);
        }
    }

    fn handle_input(&mut self, input: ControlInput) {
        match input {
            ControlInput::Command(command, reply) => {
                let result = self.handle_command(command);
                if let Err(e) = &result {
                    tracing::info!("Command rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            ControlInput::RingingExpired { handle, generation } => {
                self.ringing_expired(handle, generation)
            }
            ControlInput::DurationTick { handle, generation } => {
                if self.is_active(&handle) && self.timers.duration.is_current(generation) {
                    self.publish();
                }
            }
            ControlInput::MediaAcquired {
                handle,
                purpose,
                result,
            } => self.media_acquired(handle, purpose, result),
            ControlInput::SignalingDone { handle, op, result } => {
                self.signaling_done(handle, op, result)
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::Dial(input) => self.dial(&input),
            Command::Redial => {
                let peer = self.last_peer.clone().ok_or(CommandError::NoPreviousPeer)?;
                self.dial(&peer)
            }
            Command::Accept => self.accept(),
            Command::Reject => self.reject(),
            Command::Hangup => self.hangup(),
            Command::ToggleMute => self.toggle_mute(),
            Command::ToggleHold => self.toggle_hold(),
            Command::Rebind => {
                self.bind_listener();
                Ok(())
            }
        }
    }

    fn dial(&mut self, input: &str) -> Result<(), CommandError> {
        if self.active.is_some() {
            return Err(CommandError::Busy);
        }
        let target =
            normalize_target(input).ok_or_else(|| CommandError::InvalidTarget(input.to_string()))?;

        let handle = CallHandle::new();
        let call = Call::outbound(handle.clone(), target.clone(), self.clock.now());
        tracing::info!("Dialing {} (call {})", target, handle);
        self.active = Some(ActiveCall::new(call, self.new_recorder()));
        self.last_peer = Some(target.clone());
        self.publish();

        self.acquire_media(handle, MediaPurpose::Dial { target });
        Ok(())
    }

    fn accept(&mut self) -> Result<(), CommandError> {
        let displayed = self.displayed;
        let active = self
            .active
            .as_mut()
            .filter(|active| active.call.state() == CallState::IncomingRinging && !active.answering)
            .ok_or(CommandError::InvalidState {
                command: "accept",
                state: displayed,
            })?;
        active.answering = true;
        let handle = active.call.handle.clone();
        tracing::info!("Answering call {}", handle);
        self.acquire_media(handle, MediaPurpose::Answer);
        Ok(())
    }

    fn reject(&mut self) -> Result<(), CommandError> {
        let handle = match &self.active {
            Some(active) if active.call.state() == CallState::IncomingRinging => {
                active.call.handle.clone()
            }
            _ => {
                return Err(CommandError::InvalidState {
                    command: "reject",
                    state: self.displayed,
                })
            }
        };
        let transport = self.transport.clone();
        let target = handle.clone();
        self.spawn_signaling(handle, SignalingOp::Reject, async move {
            transport.reject(&target).await
        });
        self.finish_call(TerminalState::Ended, "rejected");
        Ok(())
    }

    fn hangup(&mut self) -> Result<(), CommandError> {
        let (handle, state, signaled) = match &self.active {
            Some(active) => (
                active.call.handle.clone(),
                active.call.state(),
                active.call.signaled,
            ),
            None => {
                return Err(CommandError::InvalidState {
                    command: "hangup",
                    state: self.displayed,
                })
            }
        };
        if state == CallState::Ending {
            return Ok(());
        }

        self.timers.cancel_all();
        if !signaled {
            self.finish_call(TerminalState::Ended, "hangup");
            return Ok(());
        }

        if let Some(active) = self.active.as_mut() {
            active.call.transition(CallState::Ending)?;
        }
        tracing::info!("Hanging up call {}", handle);
        self.publish();

        let transport = self.transport.clone();
        let target = handle.clone();
        self.spawn_signaling(handle, SignalingOp::Terminate, async move {
            transport.terminate(&target).await
        });
        Ok(())
    }

    fn toggle_mute(&mut self) -> Result<(), CommandError> {
        let active = self.active.as_mut().ok_or(CommandError::InvalidState {
            command: "mute",
            state: self.displayed,
        })?;
        let muted = active.call.toggle_mute()?;
        if let Some(media) = &active.media {
            media.set_muted(muted);
        }
        tracing::info!("Call {} {}", active.call.handle, if muted { "muted" } else { "unmuted" });
        self.publish();
        Ok(())
    }

    fn toggle_hold(&mut self) -> Result<(), CommandError> {
        let active = self.active.as_mut().ok_or(CommandError::InvalidState {
            command: "hold",
            state: self.displayed,
        })?;
        let held = active.call.toggle_hold()?;
        let handle = active.call.handle.clone();
        tracing::info!("Call {} {}", handle, if held { "on hold" } else { "resumed" });
        self.publish();

        let transport = self.transport.clone();
        let target = handle.clone();
        self.spawn_signaling(handle, SignalingOp::Hold(held), async move {
            transport.set_hold(&target, held).await
        });
        Ok(())
    }

    fn acquire_media(&self, handle: CallHandle, purpose: MediaPurpose) {
        let media = self.media.clone();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire().await;
            let _ = inputs.send(ControlInput::MediaAcquired {
                handle,
                purpose,
                result,
            });
        });
    }

    fn spawn_signaling<F>(&self, handle: CallHandle, op: SignalingOp, operation: F)
    where
        F: Future<Output = Result<(), SipError>> + Send + 'static,
    {
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = operation.await;
            let _ = inputs.send(ControlInput::SignalingDone { handle, op, result });
        });
    }

    fn media_acquired(
        &mut self,
        handle: CallHandle,
        purpose: MediaPurpose,
        result: Result<LocalMedia, MediaError>,
    ) {
        let expected = match purpose {
            MediaPurpose::Dial { .. } => CallState::Dialing,
            MediaPurpose::Answer => CallState::IncomingRinging,
        };
        let still_wanted = self
            .active
            .as_ref()
            .is_some_and(|active| active.call.handle == handle && active.call.state() == expected);
        if !still_wanted {
            tracing::debug!("Discarding media acquired for stale call {}", handle);
            if let Ok(media) = result {
                media.release();
            }
            return;
        }

        let media = match result {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!("Call {}: {}", handle, e);
                if matches!(purpose, MediaPurpose::Answer) {
                    let transport = self.transport.clone();
                    let target = handle.clone();
                    self.spawn_signaling(handle, SignalingOp::Reject, async move {
                        transport.reject(&target).await
                    });
                }
                self.finish_call(TerminalState::Failed, "media-acquisition");
                return;
            }
        };

        if let Some(active) = self.active.as_mut() {
            active.media = Some(media.clone());
            active.call.signaled = true;
        }

        let transport = self.transport.clone();
        let target_handle = handle.clone();
        match purpose {
            MediaPurpose::Dial { target } => {
                self.spawn_signaling(handle, SignalingOp::Invite, async move {
                    transport.invite(&target_handle, &target, &media).await
                });
            }
            MediaPurpose::Answer => {
                self.spawn_signaling(handle, SignalingOp::Answer, async move {
                    transport.answer(&target_handle, &media).await
                });
            }
        }
    }

    fn signaling_done(&mut self, handle: CallHandle, op: SignalingOp, result: Result<(), SipError>) {
        let state = match &self.active {
            Some(active) if active.call.handle == handle => active.call.state(),
            _ => {
                match (op, result) {
                    // The session came up after the call was over
                    (SignalingOp::Invite | SignalingOp::Answer, Ok(())) => {
                        tracing::info!(
                            "{:?} for finished call {} went through, tearing it down",
                            op,
                            handle
                        );
                        self.discard_session(handle);
                    }
                    (op, Err(e)) => {
                        tracing::debug!("{:?} for finished call {} failed: {}", op, handle, e)
                    }
                    _ => {}
                }
                return;
            }
        };

        match (op, result) {
            (SignalingOp::Terminate, result) => {
                if let Err(e) = result {
                    tracing::warn!("Hangup of call {} failed: {}", handle, e);
                }
                if state == CallState::Ending {
                    self.finish_call(TerminalState::Ended, "hangup");
                }
            }
            (SignalingOp::Invite | SignalingOp::Answer, Err(e)) if state != CallState::Ending => {
                tracing::warn!("{:?} for call {} failed: {}", op, handle, e);
                self.finish_call(TerminalState::Failed, format!("signaling: {}", e));
            }
            (SignalingOp::Answer, Ok(())) if state != CallState::Ending => self.establish(),
            (SignalingOp::Invite | SignalingOp::Answer, Ok(())) if state == CallState::Ending => {
                // Hung up while this was in flight; the earlier terminate may have missed it
                let transport = self.transport.clone();
                let target = handle.clone();
                self.spawn_signaling(handle, SignalingOp::Terminate, async move {
                    transport.terminate(&target).await
                });
            }
            (SignalingOp::Hold(requested), Err(e)) => {
                tracing::warn!("Hold change for call {} failed: {}", handle, e);
                if let Some(active) = self.active.as_mut() {
                    if active.call.state() == CallState::Established && active.call.held == requested {
                        active.call.held = !requested;
                    }
                }
                self.publish();
            }
            (op, Err(e)) => tracing::debug!("{:?} for call {} failed: {}", op, handle, e),
            _ => {}
        }
    }

    fn handle_signal(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Registered
            | SignalingEvent::RegistrationFailed(_)
            | SignalingEvent::Unregistered => {}
            SignalingEvent::IncomingCall {
                handle,
                from,
                display_name,
            } => self.incoming(handle, from, display_name),
            SignalingEvent::Session { handle, event } => {
                if !self.is_active(&handle) {
                    tracing::debug!("Ignoring {:?} for stale call {}", event, handle);
                    return;
                }
                match event {
                    SessionEvent::Progress => self.progress(),
                    SessionEvent::Accepted | SessionEvent::Confirmed => self.establish(),
                    SessionEvent::TrackAdded(track) => self.track_added(track),
                    SessionEvent::Connectivity(state) => self.connectivity(state),
                    SessionEvent::Ended(reason) => self.session_ended(reason),
                }
            }
        }
    }

    fn incoming(&mut self, handle: CallHandle, from: String, display_name: Option<String>) {
        if self.active.is_some() {
            tracing::info!("Busy, declining call from {}", from);
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.reject(&handle).await {
                    tracing::debug!("Declining call {} failed: {}", handle, e);
                }
                transport.release(&handle).await;
            });
            return;
        }

        let digits = normalize_target(&from);
        let mut call = Call::inbound(
            handle.clone(),
            digits.clone().unwrap_or(from),
            self.clock.now(),
        );
        call.peer_display_name = display_name;
        tracing::info!("Incoming call {} from {}", handle, call.peer);
        self.active = Some(ActiveCall::new(call, self.new_recorder()));
        if digits.is_some() {
            self.last_peer = digits;
        }
        self.publish();
    }

    fn progress(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.call.state() {
            CallState::Dialing => {
                if let Err(e) = active.call.transition(CallState::Ringing) {
                    tracing::warn!("{}", e);
                    return;
                }
            }
            CallState::Ringing => {}
            _ => return,
        }
        let handle = active.call.handle.clone();
        self.arm_ringing(handle);
        self.publish();
    }

    fn arm_ringing(&mut self, handle: CallHandle) {
        let inputs = self.inputs_tx.clone();
        let timeout = self.config.ringing_timeout;
        self.timers.ringing.arm(move |generation| async move {
            tokio::time::sleep(timeout).await;
            let _ = inputs.send(ControlInput::RingingExpired { handle, generation });
        });
    }

    fn arm_duration(&mut self, handle: CallHandle) {
        let inputs = self.inputs_tx.clone();
        self.timers.duration.arm(move |generation| async move {
            let mut ticks = interval_at(Instant::now() + DURATION_TICK, DURATION_TICK);
            loop {
                ticks.tick().await;
                let tick = ControlInput::DurationTick {
                    handle: handle.clone(),
                    generation,
                };
                if inputs.send(tick).is_err() {
                    break;
                }
            }
        });
    }

    fn ringing_expired(&mut self, handle: CallHandle, generation: u64) {
        if !self.is_active(&handle) || !self.timers.ringing.is_current(generation) {
            tracing::trace!("Stale ringing expiry for call {}", handle);
            return;
        }
        self.timers.ringing.clear();
        if self.active_state() != Some(CallState::Ringing) {
            return;
        }

        tracing::info!(
            "Call {} not answered within {}s",
            handle,
            self.config.ringing_timeout.as_secs()
        );
        let transport = self.transport.clone();
        let target = handle.clone();
        self.spawn_signaling(handle, SignalingOp::Terminate, async move {
            transport.terminate(&target).await
        });
        self.finish_call(TerminalState::NoAnswer, "no-answer");
    }

    fn establish(&mut self) {
        let now = self.clock.now();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !matches!(
            active.call.state(),
            CallState::Dialing | CallState::Ringing | CallState::IncomingRinging
        ) {
            return;
        }
        if let Err(e) = active.call.establish(now) {
            tracing::warn!("{}", e);
            return;
        }
        active.answering = false;
        let handle = active.call.handle.clone();
        let audio_input = active.media.as_ref().and_then(|media| media.audio_input());
        tracing::info!("Call {} established with {}", handle, active.call.peer);
        self.audio.send_replace(audio_input);

        self.timers.ringing.cancel();
        self.arm_duration(handle);
        self.start_recording();
        self.publish();
    }

    fn start_recording(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let mut tracks = std::mem::take(&mut active.pending_tracks);
        tracks.extend(self.transport.take_tracks(&active.call.handle));
        active.feed_recorder(tracks);
    }

    fn track_added(&mut self, track: MediaTrack) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        tracing::debug!("Call {}: {:?} track {}", active.call.handle, track.direction, track.id);
        if active.call.state() == CallState::Established {
            active.feed_recorder(vec![track]);
        } else {
            active.pending_tracks.push(track);
        }
    }

    fn connectivity(&mut self, state: ConnectivityState) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        match state {
            ConnectivityState::Failed => {
                let terminal = if active.call.answer_time.is_some() {
                    TerminalState::Ended
                } else {
                    TerminalState::Failed
                };
                let handle = active.call.handle.clone();
                let signaled = active.call.signaled;
                tracing::warn!("Media connectivity of call {} failed", handle);
                if signaled {
                    let transport = self.transport.clone();
                    let target = handle.clone();
                    self.spawn_signaling(handle, SignalingOp::Terminate, async move {
                        transport.terminate(&target).await
                    });
                }
                self.finish_call(terminal, "connectivity-failed");
            }
            ConnectivityState::Disconnected => {
                tracing::warn!("Media of call {} disconnected", active.call.handle)
            }
            ConnectivityState::Connected => {
                tracing::debug!("Media of call {} connected", active.call.handle)
            }
        }
    }

    fn session_ended(&mut self, reason: EndReason) {
        let Some(state) = self.active_state() else {
            return;
        };
        self.finish_call(terminal_for(&reason, state), reason.cause());
    }

    /// Compare the tracked call with what the transport reports and repair
    /// any drift
    fn reconcile(&mut self) {
        let Some(active) = &self.active else {
            if self.displayed.is_in_progress() {
                tracing::warn!("Display shows {} with no tracked call, resetting", self.displayed);
                self.timers.cancel_all();
                self.displayed = CallState::Idle;
                self.publish();
            }
            return;
        };
        if !active.call.signaled {
            return;
        }

        let state = active.call.state();
        let handle = active.call.handle.clone();
        match self.transport.session_state(&handle) {
            SessionState::Ended(reason) => {
                tracing::warn!("Call {} ended underneath us ({})", handle, reason.cause());
                self.finish_call(terminal_for(&reason, state), reason.cause());
            }
            SessionState::Unknown
                if matches!(
                    state,
                    CallState::IncomingRinging
                        | CallState::Ringing
                        | CallState::Established
                        | CallState::Ending
                ) =>
            {
                tracing::warn!("Transport lost track of call {}", handle);
                self.finish_call(TerminalState::Terminated, "session-lost");
            }
            SessionState::Established if matches!(state, CallState::Dialing | CallState::Ringing) => {
                tracing::info!("Call {} answered without notice", handle);
                self.establish();
            }
            _ => {}
        }
    }

    /// Move the active call to `terminal` and hand it to finalization.
    /// No-op when there is no active call or it already ended.
    fn finish_call(&mut self, terminal: TerminalState, cause: impl Into<String>) {
        let now = self.clock.now();
        let cause = cause.into();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.call.terminate(terminal, Some(cause.clone()), now) {
            return;
        }
        tracing::info!("Call {} {} ({})", active.call.handle, terminal.label(), cause);
        if let Some(media) = &active.media {
            media.release();
        }
        self.audio.send_replace(None);
        self.timers.cancel_all();
        self.publish();
        self.begin_finalization();
    }

    fn begin_finalization(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if !active.call.begin_finalization() {
            return;
        }
        let finalizer = self.finalizer.clone();
        let transport = self.transport.clone();
        let extension = self.agent.credentials().extension.clone();
        let handle = active.call.handle.clone();
        let signaled = active.call.signaled;
        self.finalizing.spawn(async move {
            let cdr = finalizer
                .finalize(&extension, active.call, Some(active.recorder))
                .await;
            if signaled {
                transport.release(&handle).await;
            }
            cdr
        });
    }

    /// Tear down and forget a session no call owns any more
    fn discard_session(&self, handle: CallHandle) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.terminate(&handle).await {
                tracing::debug!("Tearing down session {} failed: {}", handle, e);
            }
            transport.release(&handle).await;
        });
    }

    fn finalized(&mut self, done: Result<CallDetailRecord, JoinError>) {
        match done {
            Ok(cdr) => {
                tracing::debug!("Call {} finalized", cdr.call_id);
                self.last_record = Some(cdr);
            }
            Err(e) => tracing::error!("Finalization task failed: {}", e),
        }
        if self.active.is_none() {
            self.displayed = CallState::Idle;
        }
        self.publish();
    }

    fn new_recorder(&self) -> RecordingSession {
        RecordingSession::new(
            self.config.chunk_interval,
            AudioMixer::new(self.config.mix_mode, None),
        )
    }

    fn is_active(&self, handle: &CallHandle) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| &active.call.handle == handle)
    }

    fn active_state(&self) -> Option<CallState> {
        self.active.as_ref().map(|active| active.call.state())
    }

    fn publish(&mut self) {
        let now = self.clock.now();
        let status = match &self.active {
            Some(active) => {
                let call = &active.call;
                self.displayed = call.state();
                PhoneStatus {
                    state: call.state(),
                    registration: self.registration.clone(),
                    peer: Some(call.peer.clone()),
                    peer_display_name: call.peer_display_name.clone(),
                    direction: Some(call.direction),
                    elapsed_seconds: call.elapsed_seconds(now),
                    muted: call.muted,
                    held: call.held,
                    cause: call.cause.clone(),
                    last_record: self.last_record.clone(),
                }
            }
            None => PhoneStatus {
                state: self.displayed,
                ..PhoneStatus::idle(self.registration.clone(), self.last_record.clone())
            },
        };
        self.status.send_replace(status);
    }
}

/// Terminal state for a transport-reported end. A call we were already
/// hanging up always ends normally.
fn terminal_for(reason: &EndReason, state: CallState) -> TerminalState {
    if state == CallState::Ending {
        return TerminalState::Ended;
    }
    match reason {
        EndReason::Bye | EndReason::Cancelled | EndReason::Ended => TerminalState::Ended,
        EndReason::Rejected(_) | EndReason::Failed(_) => TerminalState::Failed,
        EndReason::Terminated(_) => TerminalState::Terminated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::scenario_tests::Harness;

    #[test]
    fn test_terminal_mapping() {
        use CallState::*;
        assert_eq!(terminal_for(&EndReason::Bye, Established), TerminalState::Ended);
        assert_eq!(terminal_for(&EndReason::Cancelled, Ringing), TerminalState::Ended);
        assert_eq!(terminal_for(&EndReason::Rejected(486), Ringing), TerminalState::Failed);
        assert_eq!(
            terminal_for(&EndReason::Failed("488".into()), Dialing),
            TerminalState::Failed
        );
        assert_eq!(
            terminal_for(&EndReason::Terminated("transport".into()), Established),
            TerminalState::Terminated
        );
        assert_eq!(
            terminal_for(&EndReason::Terminated("transport".into()), Ending),
            TerminalState::Ended
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_resets_orphaned_display() {
        let harness = Harness::new();
        let mut core = CallCore::new(
            harness.deps(),
            mpsc::unbounded_channel().0,
            mpsc::unbounded_channel().0,
        );
        let mut status = core.status.subscribe();

        core.displayed = CallState::Established;
        core.timers.ringing.arm(|_| std::future::pending());
        core.reconcile();
        assert_eq!(status.borrow_and_update().state, CallState::Idle);
        assert!(!core.timers.ringing.is_armed());

        core.reconcile();
        assert!(!status.has_changed().unwrap());
        assert_eq!(core.displayed, CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_leaves_finalizing_display_alone() {
        let harness = Harness::new();
        let mut core = CallCore::new(
            harness.deps(),
            mpsc::unbounded_channel().0,
            mpsc::unbounded_channel().0,
        );
        let mut status = core.status.subscribe();

        core.displayed = CallState::Terminal(TerminalState::NoAnswer);
        core.reconcile();
        assert!(!status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().state, CallState::Idle);
        assert_eq!(core.displayed, CallState::Terminal(TerminalState::NoAnswer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_terminates_lost_session() {
        let harness = Harness::new();
        let mut core = CallCore::new(
            harness.deps(),
            mpsc::unbounded_channel().0,
            mpsc::unbounded_channel().0,
        );

        let handle = CallHandle::from("lost");
        let mut call = Call::inbound(handle.clone(), "5550100", core.clock.now());
        call.establish(core.clock.now()).unwrap();
        core.active = Some(ActiveCall::new(call, core.new_recorder()));

        core.reconcile();
        assert!(core.active.is_none());
        assert_eq!(core.displayed, CallState::Terminal(TerminalState::Terminated));

        let cdr = core.finalizing.join_next().await.unwrap().unwrap();
        assert_eq!(cdr.cause.as_deref(), Some("session-lost"));
        assert_eq!(harness.store.submitted().len(), 1);
    }
}
