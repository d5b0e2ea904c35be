//! VoIP softphone call-control core
//!
//! Registers an extension with a SIP server, places and receives calls,
//! tracks each call through its state machine, records the call audio and
//! emits exactly one call-detail record per call.

pub mod call;
pub mod cdr;
pub mod config;
pub mod media;
pub mod sip;
pub mod softphone;

pub use call::{CallControl, CallState, CommandError, PhoneStatus};
pub use config::{ConfigError, CoreConfig};
pub use softphone::{init_softphone, softphone, Softphone};
