//! # Agentdesk Phone-Core
//!
//! Inbound call session manager for the agent console.
//!
//! This crate provides:
//! - Access token fetching and periodic refresh for the telephony SDK
//! - Telephony device registration with backoff retries
//! - A WebSocket signalling channel to the call-routing server with heartbeat,
//!   health tracking and automatic reconnect
//! - The single-call lifecycle (ringing, active, ended) with duration, quality
//!   and mute tracking
//! - Microphone capture, input level metering and audio device selection
//!
//! ## Architecture
//!
//! Every component is a plain state machine that is driven by
//! [`manager::SessionManager`], which owns all of them on one task and
//! publishes a [`manager::SessionSnapshot`] after every change. The telephony
//! SDK, the token endpoint, the WebSocket and the platform audio stack sit
//! behind traits so each can be replaced by the simulated implementations in
//! [`telephony::mock`], [`audio::mock`] and [`signalling::MemoryTransport`].

pub mod audio;
pub mod backoff;
pub mod call;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod events;
pub mod manager;
pub mod registration;
pub mod signalling;
pub mod telephony;
pub mod timer;

pub use backoff::Backoff;
pub use config::{AcceptConstraints, SessionConfig, TimingConfig};
pub use connection::{ConnectionState, StatusLevel};
pub use credential::{Credential, HttpTokenProvider, TokenProvider};
pub use error::{PhoneError, PhoneResult};
pub use events::{LogNotifier, NoticeLevel, Notifier, SessionNotice};
pub use manager::{SessionDeps, SessionHandle, SessionManager, SessionSnapshot};
