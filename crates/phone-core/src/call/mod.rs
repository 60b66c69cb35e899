//! Call Session State Machine
//!
//! Tracks the single call the agent can be on: who is calling, how long the
//! call has been running, how good it sounds, and whether the microphone is
//! muted. A second concurrent call is never tracked; the device is configured
//! without call waiting and any extra incoming event is ignored.

pub mod machine;
pub mod session;

pub use machine::{CallEffect, CallInput, CallSessionMachine, CallStep};
pub use session::{CallDirection, CallId, CallQuality, CallSession, CallSnapshot, CallState, EndReason};
