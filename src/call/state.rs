//! Call state machine
//!
//! `CallState` is a single tagged value, so a call can never be in two
//! states at once; terminal states are absorbing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use super::CallError;
use crate::sip::CallHandle;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// We dialed
    Outbound,
    /// We were called
    Inbound,
}

/// How a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Normal hangup by either side
    Ended,
    /// Never got going: media, negotiation or rejection
    Failed,
    /// Ringing watchdog expired
    NoAnswer,
    /// Torn down underneath us (transport loss, session vanished)
    Terminated,
}

impl TerminalState {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalState::Ended => "ended",
            TerminalState::Failed => "failed",
            TerminalState::NoAnswer => "no-answer",
            TerminalState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Dialing,
    IncomingRinging,
    Ringing,
    Established,
    Ending,
    Terminal(TerminalState),
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::IncomingRinging => "incoming",
            CallState::Ringing => "ringing",
            CallState::Established => "established",
            CallState::Ending => "ending",
            CallState::Terminal(terminal) => terminal.label(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminal(_))
    }

    /// Neither idle nor terminal
    pub fn is_in_progress(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Terminal(_))
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Terminal(_), _) => false,
            (_, Terminal(_)) => !matches!(self, Idle),
            (Idle, Dialing | IncomingRinging) => true,
            (Dialing, Ringing | Established | Ending) => true,
            (IncomingRinging, Established | Ending) => true,
            (Ringing, Established | Ending) => true,
            (Established, Ending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for CallState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// One call attempt, owned by the call core
#[derive(Debug, Clone)]
pub struct Call {
    pub handle: CallHandle,
    pub direction: Direction,
    pub peer: String,
    /// Caller-supplied name of the remote party, inbound only
    pub peer_display_name: Option<String>,
    state: CallState,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cause: Option<String>,
    pub muted: bool,
    pub held: bool,
    /// The transport knows about this call (invite sent or received)
    pub signaled: bool,
    finalizing: bool,
}

impl Call {
    pub fn outbound(handle: CallHandle, peer: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(handle, Direction::Outbound, peer.into(), CallState::Dialing, now)
    }

    pub fn inbound(handle: CallHandle, peer: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut call = Self::new(
            handle,
            Direction::Inbound,
            peer.into(),
            CallState::IncomingRinging,
            now,
        );
        call.signaled = true;
        call
    }

    fn new(
        handle: CallHandle,
        direction: Direction,
        peer: String,
        state: CallState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            handle,
            direction,
            peer,
            peer_display_name: None,
            state,
            start_time: now,
            answer_time: None,
            end_time: None,
            cause: None,
            muted: false,
            held: false,
            signaled: false,
            finalizing: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn transition(&mut self, next: CallState) -> Result<(), CallError> {
        if !self.state.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("Call {}: {} -> {}", self.handle, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Enter `Established`, stamping answer_time the first time
    pub fn establish(&mut self, now: DateTime<Utc>) -> Result<(), CallError> {
        self.transition(CallState::Established)?;
        self.answer_time.get_or_insert(now);
        Ok(())
    }

    /// Enter a terminal state; false when already terminal
    pub fn terminate(
        &mut self,
        terminal: TerminalState,
        cause: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = CallState::Terminal(terminal);
        self.end_time = Some(now);
        if self.cause.is_none() {
            self.cause = cause;
        }
        self.muted = false;
        self.held = false;
        true
    }

    /// Claim finalization; only the first caller gets `true`
    pub fn begin_finalization(&mut self) -> bool {
        !std::mem::replace(&mut self.finalizing, true)
    }

    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        self.require_established("mute")?;
        self.muted = !self.muted;
        Ok(self.muted)
    }

    pub fn toggle_hold(&mut self) -> Result<bool, CallError> {
        self.require_established("hold")?;
        self.held = !self.held;
        Ok(self.held)
    }

    fn require_established(&self, action: &'static str) -> Result<(), CallError> {
        if self.state == CallState::Established {
            Ok(())
        } else {
            Err(CallError::NotEstablished {
                action,
                state: self.state,
            })
        }
    }

    /// end - answer in whole seconds; None unless answered and ended
    pub fn duration_seconds(&self) -> Option<i64> {
        let answered = self.answer_time?;
        let ended = self.end_time?;
        Some((ended - answered).num_seconds().max(0))
    }

    /// Seconds since answer while established
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        match (self.state, self.answer_time) {
            (CallState::Established, Some(answered)) => Some((now - answered).num_seconds().max(0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_outbound_happy_path() {
        let mut call = Call::outbound(CallHandle::new(), "5551234", t0());
        assert_eq!(call.state(), CallState::Dialing);

        call.transition(CallState::Ringing).unwrap();
        call.establish(t0() + Duration::seconds(3)).unwrap();
        assert!(call.terminate(TerminalState::Ended, Some("bye".into()), t0() + Duration::seconds(13)));

        assert_eq!(call.state(), CallState::Terminal(TerminalState::Ended));
        assert_eq!(call.duration_seconds(), Some(10));
        assert_eq!(call.cause.as_deref(), Some("bye"));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut call = Call::outbound(CallHandle::new(), "1", t0());
        assert!(call.terminate(TerminalState::NoAnswer, Some("no-answer".into()), t0()));

        assert!(!call.terminate(TerminalState::Ended, Some("bye".into()), t0()));
        assert!(call.transition(CallState::Established).is_err());
        assert!(call.transition(CallState::Ending).is_err());
        assert_eq!(call.state(), CallState::Terminal(TerminalState::NoAnswer));
        assert_eq!(call.cause.as_deref(), Some("no-answer"));
    }

    #[test]
    fn test_answer_time_is_set_once() {
        let mut call = Call::inbound(CallHandle::new(), "1", t0());
        call.establish(t0() + Duration::seconds(2)).unwrap();
        assert!(call.establish(t0() + Duration::seconds(5)).is_err());
        assert_eq!(call.answer_time, Some(t0() + Duration::seconds(2)));
    }

    #[test]
    fn test_transition_table() {
        use CallState::*;
        assert!(Idle.can_transition_to(Dialing));
        assert!(Idle.can_transition_to(IncomingRinging));
        assert!(!Idle.can_transition_to(Established));
        assert!(!Idle.can_transition_to(Terminal(TerminalState::Ended)));
        assert!(Dialing.can_transition_to(Established));
        assert!(!IncomingRinging.can_transition_to(Ringing));
        assert!(Ending.can_transition_to(Terminal(TerminalState::Ended)));
        assert!(!Ending.can_transition_to(Established));
        assert!(!Established.can_transition_to(Ringing));
    }

    #[test]
    fn test_mute_and_hold_only_while_established() {
        let mut call = Call::outbound(CallHandle::new(), "1", t0());
        assert!(call.toggle_mute().is_err());
        assert!(call.toggle_hold().is_err());

        call.establish(t0()).unwrap();
        assert!(call.toggle_mute().unwrap());
        assert!(call.toggle_hold().unwrap());
        assert!(!call.toggle_mute().unwrap());

        call.terminate(TerminalState::Ended, None, t0());
        assert!(!call.muted && !call.held);
    }

    #[test]
    fn test_finalization_claimed_once() {
        let mut call = Call::outbound(CallHandle::new(), "1", t0());
        assert!(call.begin_finalization());
        assert!(!call.begin_finalization());
    }

    #[test]
    fn test_unanswered_call_has_no_duration() {
        let mut call = Call::outbound(CallHandle::new(), "1", t0());
        call.terminate(TerminalState::Failed, None, t0() + Duration::seconds(4));
        assert_eq!(call.duration_seconds(), None);
        assert_eq!(call.elapsed_seconds(t0()), None);
    }

    #[test]
    fn test_labels_serialize() {
        assert_eq!(
            serde_json::to_string(&CallState::Terminal(TerminalState::NoAnswer)).unwrap(),
            "\"no-answer\""
        );
        assert_eq!(CallState::IncomingRinging.to_string(), "incoming");
    }
}
