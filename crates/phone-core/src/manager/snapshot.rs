//! Published session view

use crate::audio::AudioState;
use crate::call::CallSnapshot;
use crate::connection::{ConnectionState, StatusLevel};
use crate::registration::RegistrationState;
use crate::signalling::SignallingState;

/// Immutable view of the whole session, republished after every update
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub call: CallSnapshot,
    pub connection: ConnectionState,
    pub audio: AudioState,
    /// Worst current condition
    pub status: StatusLevel,
    pub status_message: String,
    /// Last non-terminal error reported by a backend (e.g. agent registration refused)
    pub last_error: Option<String>,
    /// Offer the manual reconnect action
    pub can_reconnect: bool,
    /// The session was torn down
    pub shut_down: bool,
}

impl SessionSnapshot {
    /// View before anything has happened
    pub fn initial() -> Self {
        let connection = ConnectionState {
            signalling: SignallingState::Disconnected,
            device: RegistrationState::Uninitialized,
            last_heartbeat_at: None,
            heartbeat_age: None,
            reconnect_attempts: 0,
            registration_attempts: 0,
            healthy: false,
        };
        Self {
            call: CallSnapshot::idle(),
            status: connection.status_level(),
            status_message: connection.status_message(),
            can_reconnect: false,
            connection,
            audio: AudioState::default(),
            last_error: None,
            shut_down: false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.connection.healthy
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::initial()
    }
}
