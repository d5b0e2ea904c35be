//! Call control
//!
//! One actor task (`CallCore`) owns every piece of call state. Commands,
//! signaling events, timer expirations and the results of spawned network
//! or media operations all arrive on its input queue and are handled in
//! order, so no call state is ever shared or locked.

mod clock;
mod core;
mod state;
mod timers;


pub use self::clock::Clock;
pub use self::core::{CallControl, CallCore, CoreDeps, PhoneStatus};
pub use self::state::{Call, CallState, Direction, TerminalState};
pub use self::timers::{CallTimers, TimerSlot};

use thiserror::Error;

/// Illegal state-machine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("Cannot {action} while {state}")]
    NotEstablished { action: &'static str, state: CallState },
}

/// Why a user command was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{command} is not allowed while {state}")]
    InvalidState { command: &'static str, state: CallState },

    #[error("A call is already in progress")]
    Busy,

    #[error("Invalid dial target: {0:?}")]
    InvalidTarget(String),

    #[error("No previous number to redial")]
    NoPreviousPeer,

    #[error("Call control is not running")]
    Stopped,
}

impl From<CallError> for CommandError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::InvalidTransition { from, .. } => CommandError::InvalidState {
                command: "transition",
                state: from,
            },
            CallError::NotEstablished { action, state } => CommandError::InvalidState {
                command: action,
                state,
            },
        }
    }
}

/// Reduce free-text input to the digits that get dialed
pub fn normalize_target(input: &str) -> Option<String> {
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}
