//! Connection health
//!
//! [`ConnectionState`] combines the two network legs (signalling and device
//! registration) into one record. It is recomputed from the owning components
//! on every publish, so nothing outside them can mutate it.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::registration::{DeviceRegistrationManager, RegistrationState};
use crate::signalling::{SignallingChannel, SignallingState};

/// Worst current condition, shown in the persistent status line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusLevel {
    Healthy,
    Degraded,
    Disconnected,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::Healthy => write!(f, "healthy"),
            StatusLevel::Degraded => write!(f, "degraded"),
            StatusLevel::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Health record for the signalling and device legs
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub signalling: SignallingState,
    pub device: RegistrationState,
    pub last_heartbeat_at: Option<Instant>,
    /// Age of the last inbound signalling traffic when this record was built
    pub heartbeat_age: Option<Duration>,
    /// Consecutive signalling reconnect attempts, reset on a successful connect
    pub reconnect_attempts: u32,
    /// Consecutive registration failures, reset on a successful register
    pub registration_attempts: u32,
    /// Both legs up and the heartbeat fresh
    pub healthy: bool,
}

impl ConnectionState {
    /// Build the record from the components that own each leg
    pub fn evaluate(channel: &SignallingChannel, registration: &DeviceRegistrationManager, now: Instant) -> Self {
        let device = registration.state();
        Self {
            signalling: channel.state(),
            device,
            last_heartbeat_at: channel.last_heartbeat_at(),
            heartbeat_age: channel.heartbeat_age(now),
            reconnect_attempts: channel.reconnect_attempts(),
            registration_attempts: registration.attempts(),
            healthy: channel.is_healthy(now) && device == RegistrationState::Registered,
        }
    }

    /// Disconnected when calls cannot arrive, degraded when presence is impaired
    pub fn status_level(&self) -> StatusLevel {
        if self.device != RegistrationState::Registered {
            StatusLevel::Disconnected
        } else if !self.healthy {
            StatusLevel::Degraded
        } else {
            StatusLevel::Healthy
        }
    }

    /// Text for the status line
    pub fn status_message(&self) -> String {
        match self.status_level() {
            StatusLevel::Healthy => "Ready for calls".to_string(),
            StatusLevel::Disconnected => match self.device {
                RegistrationState::Uninitialized | RegistrationState::Initializing => {
                    "Connecting phone...".to_string()
                }
                RegistrationState::Error if self.registration_attempts > 0 => format!(
                    "Phone registration failed, retrying (attempt {})",
                    self.registration_attempts
                ),
                _ => "Phone disconnected".to_string(),
            },
            StatusLevel::Degraded => match self.signalling {
                SignallingState::Connected => "Routing connection is not responding".to_string(),
                SignallingState::Connecting => "Connecting to call routing...".to_string(),
                _ if self.reconnect_attempts > 0 => format!(
                    "Routing connection lost, reconnecting (attempt {})",
                    self.reconnect_attempts
                ),
                _ => "Routing connection lost".to_string(),
            },
        }
    }

    /// The manual reconnect affordance is offered whenever health is lost
    pub fn can_reconnect(&self) -> bool {
        !self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(signalling: SignallingState, device: RegistrationState, healthy: bool) -> ConnectionState {
        ConnectionState {
            signalling,
            device,
            last_heartbeat_at: None,
            heartbeat_age: None,
            reconnect_attempts: 0,
            registration_attempts: 0,
            healthy,
        }
    }

    #[test]
    fn test_worst_condition_wins() {
        let down = state(SignallingState::Disconnected, RegistrationState::Error, false);
        assert_eq!(down.status_level(), StatusLevel::Disconnected);

        let stale = state(SignallingState::Connected, RegistrationState::Registered, false);
        assert_eq!(stale.status_level(), StatusLevel::Degraded);
        assert_eq!(stale.status_message(), "Routing connection is not responding");
        assert!(stale.can_reconnect());

        let fine = state(SignallingState::Connected, RegistrationState::Registered, true);
        assert_eq!(fine.status_level(), StatusLevel::Healthy);
        assert!(!fine.can_reconnect());
    }

    #[test]
    fn test_ordering_matches_severity() {
        assert!(StatusLevel::Disconnected > StatusLevel::Degraded);
        assert!(StatusLevel::Degraded > StatusLevel::Healthy);
    }
}
