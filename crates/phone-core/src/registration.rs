//! Device Registration Manager
//!
//! Owns the telephony device object and its registration lifecycle.
//!
//! ```text
//!                Initialize               Registered
//! UNINITIALIZED ───────────▶ INITIALIZING ──────────▶ REGISTERED
//!                                 ▲   │                    │
//!                     ReRegister  │   │ RegisterFailed     │ Unregistered
//!                                 │   ▼ DeviceError        ▼
//!                                 │  ERROR            UNREGISTERED
//!                                 │   │  (retry with     │
//!                                 │   │   fresh token)   │ (fixed delay)
//!                                 └───┴──────────────────┘
//! ```
//!
//! Registration failures are retried forever: the console is long-lived and
//! must keep trying until the operator closes it. The retry delay comes from
//! the registration backoff keyed on the number of failures so far (5s, 10s,
//! 20s ... capped at 60s) and every retry starts from a freshly fetched token.
//!
//! At most one device is live. [`DeviceRegistrationManager::initialize`]
//! destroys the previous device and stops its event pump before the new one
//! is wired, and every device gets a new generation so late events or
//! register results from a destroyed device can be told apart.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{PhoneError, PhoneResult};
use crate::telephony::{DeviceEvent, DeviceOptions, TelephonyConnector, TelephonyDevice};

/// Registration state of the telephony device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Uninitialized,
    Initializing,
    Registered,
    Unregistered,
    Error,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Uninitialized => write!(f, "uninitialized"),
            RegistrationState::Initializing => write!(f, "initializing"),
            RegistrationState::Registered => write!(f, "registered"),
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::Error => write!(f, "error"),
        }
    }
}

/// Input to the registration state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new device was constructed
    Initialize,
    /// `register()` succeeded or the SDK reported registration
    Registered,
    /// The SDK lost its registration on its own
    Unregistered,
    RegisterFailed { reason: String },
    /// The SDK reported a device-level fault
    DeviceError { reason: String },
    /// The fresh token for a retry could not be fetched
    TokenFetchFailed { reason: String },
    /// Register the existing device again
    ReRegister,
    Destroyed,
}

/// Work the owner must perform after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationAction {
    /// Call `register()` on the current device
    Register,
    /// Fetch a new token after `delay`, then rebuild and register the device
    RetryWithFreshToken { delay: Duration, attempt: u32 },
    /// Register the current device again after `delay`
    ReRegisterAfter(Duration),
    /// Drop any pending retry or re-register timer
    CancelRetries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationStep {
    pub from: RegistrationState,
    pub to: RegistrationState,
    pub actions: Vec<RegistrationAction>,
}

/// Owner of the telephony device
pub struct DeviceRegistrationManager {
    connector: Arc<dyn TelephonyConnector>,
    options: DeviceOptions,
    backoff: Backoff,
    reregister_delay: Duration,
    state: RegistrationState,
    attempts: u32,
    device: Option<Arc<dyn TelephonyDevice>>,
    generation: u64,
    pump: Option<JoinHandle<()>>,
}

impl DeviceRegistrationManager {
    pub fn new(
        connector: Arc<dyn TelephonyConnector>,
        options: DeviceOptions,
        backoff: Backoff,
        reregister_delay: Duration,
    ) -> Self {
        Self {
            connector,
            options,
            backoff,
            reregister_delay,
            state: RegistrationState::Uninitialized,
            attempts: 0,
            device: None,
            generation: 0,
            pump: None,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Consecutive registration failures since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget past failures so the next retry starts from the base delay
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    pub fn device(&self) -> Option<Arc<dyn TelephonyDevice>> {
        self.device.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` still names the live device
    pub fn is_current(&self, generation: u64) -> bool {
        self.device.is_some() && self.generation == generation
    }

    /// Transition function
    pub fn apply(&mut self, event: RegistrationEvent) -> Option<RegistrationStep> {
        use RegistrationAction as A;
        use RegistrationState as S;

        let from = self.state;
        let (to, actions) = match (from, &event) {
            (_, RegistrationEvent::Initialize) => (S::Initializing, vec![A::Register]),

            (S::Initializing | S::Unregistered, RegistrationEvent::Registered) => {
                if self.attempts > 0 {
                    info!(attempts = self.attempts, "Device registered after retries");
                }
                self.attempts = 0;
                (S::Registered, vec![A::CancelRetries])
            }

            (S::Registered, RegistrationEvent::Unregistered) => {
                warn!(delay_ms = self.reregister_delay.as_millis() as u64, "Device unregistered, re-registering");
                (S::Unregistered, vec![A::ReRegisterAfter(self.reregister_delay)])
            }

            (S::Initializing, RegistrationEvent::RegisterFailed { reason })
            | (S::Initializing | S::Registered | S::Unregistered, RegistrationEvent::DeviceError { reason })
            | (S::Uninitialized | S::Error, RegistrationEvent::TokenFetchFailed { reason }) => {
                let action = self.next_retry();
                warn!(reason = %reason, attempt = self.attempts, "Device registration failed");
                (S::Error, vec![action])
            }

            (S::Registered | S::Unregistered, RegistrationEvent::ReRegister) => {
                (S::Initializing, vec![A::CancelRetries, A::Register])
            }

            (_, RegistrationEvent::Destroyed) => {
                self.attempts = 0;
                (S::Uninitialized, vec![A::CancelRetries])
            }

            _ => {
                debug!(state = %from, ?event, "Registration event ignored");
                return None;
            }
        };

        if from != to {
            debug!(from = %from, to = %to, "Registration state changed");
        }
        self.state = to;
        Some(RegistrationStep { from, to, actions })
    }

    fn next_retry(&mut self) -> RegistrationAction {
        let delay = self.backoff.schedule_retry(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        RegistrationAction::RetryWithFreshToken {
            delay,
            attempt: self.attempts,
        }
    }

    /// Replace the device with a new one bound to `token`
    ///
    /// The previous device is destroyed first. Events from the new device are
    /// handed to `forward` together with its generation until `forward`
    /// returns `false` or the device goes away. On a construction failure the
    /// state is left at `Initializing`; the caller reports the error and
    /// applies [`RegistrationEvent::RegisterFailed`].
    pub async fn initialize<F>(&mut self, token: &str, forward: F) -> PhoneResult<RegistrationStep>
    where
        F: Fn(u64, DeviceEvent) -> bool + Send + 'static,
    {
        self.destroy_device().await;

        let step = self
            .apply(RegistrationEvent::Initialize)
            .ok_or_else(|| PhoneError::invalid_state("initialize", self.state))?;

        let handle = self.connector.create_device(token, &self.options).await?;
        self.generation += 1;
        let generation = self.generation;
        let mut events = handle.events;
        self.pump = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !forward(generation, event) {
                    break;
                }
            }
        }));
        self.device = Some(handle.device);

        info!(generation, "Telephony device created");
        Ok(step)
    }

    /// Push a refreshed token into the live device
    pub async fn update_token(&self, token: &str) -> PhoneResult<()> {
        match &self.device {
            Some(device) => device.update_token(token).await,
            None => Err(PhoneError::invalid_state("update token", self.state)),
        }
    }

    /// Destroy the device and return to `Uninitialized`
    pub async fn destroy(&mut self) -> Option<RegistrationStep> {
        self.destroy_device().await;
        self.apply(RegistrationEvent::Destroyed)
    }

    async fn destroy_device(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(device) = self.device.take() {
            debug!(generation = self.generation, "Destroying telephony device");
            device.destroy().await;
        }
    }
}

impl fmt::Debug for DeviceRegistrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistrationManager")
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("generation", &self.generation)
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telephony::mock::MockTelephony;
    use tokio::sync::mpsc;

    fn manager(telephony: &MockTelephony) -> DeviceRegistrationManager {
        DeviceRegistrationManager::new(
            Arc::new(telephony.clone()),
            DeviceOptions::default(),
            Backoff::registration(),
            Duration::from_secs(5),
        )
    }

    fn retry_delays(steps: &[RegistrationStep]) -> Vec<u64> {
        steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter_map(|a| match a {
                RegistrationAction::RetryWithFreshToken { delay, .. } => Some(delay.as_secs()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_failure_delays_follow_backoff() {
        let mut manager = manager(&MockTelephony::new());
        let mut steps = Vec::new();
        for _ in 0..3 {
            manager.apply(RegistrationEvent::Initialize).unwrap();
            steps.push(
                manager
                    .apply(RegistrationEvent::RegisterFailed { reason: "rejected".into() })
                    .unwrap(),
            );
        }
        assert_eq!(retry_delays(&steps), vec![5, 10, 20]);
        assert_eq!(manager.attempts(), 3);
        assert_eq!(manager.state(), RegistrationState::Error);

        manager.apply(RegistrationEvent::Initialize).unwrap();
        manager.apply(RegistrationEvent::Registered).unwrap();
        assert_eq!(manager.attempts(), 0);
    }

    #[test]
    fn test_unregistered_reregisters_after_fixed_delay() {
        let mut manager = manager(&MockTelephony::new());
        manager.apply(RegistrationEvent::Initialize);
        manager.apply(RegistrationEvent::Registered);
        let step = manager.apply(RegistrationEvent::Unregistered).unwrap();
        assert_eq!(step.actions, vec![RegistrationAction::ReRegisterAfter(Duration::from_secs(5))]);

        let step = manager.apply(RegistrationEvent::ReRegister).unwrap();
        assert_eq!(step.to, RegistrationState::Initializing);
        assert!(step.actions.contains(&RegistrationAction::Register));
    }

    #[test]
    fn test_error_state_does_not_stack_retries() {
        let mut manager = manager(&MockTelephony::new());
        manager.apply(RegistrationEvent::Initialize);
        manager.apply(RegistrationEvent::DeviceError { reason: "transport".into() }).unwrap();
        assert!(manager
            .apply(RegistrationEvent::DeviceError { reason: "again".into() })
            .is_none());
        assert!(manager
            .apply(RegistrationEvent::RegisterFailed { reason: "late".into() })
            .is_none());
        assert_eq!(manager.attempts(), 1);
    }

    #[test]
    fn test_token_failure_keeps_retrying() {
        let mut manager = manager(&MockTelephony::new());
        let first = manager
            .apply(RegistrationEvent::TokenFetchFailed { reason: "503".into() })
            .unwrap();
        let second = manager
            .apply(RegistrationEvent::TokenFetchFailed { reason: "503".into() })
            .unwrap();
        assert_eq!(retry_delays(&[first, second]), vec![5, 10]);
    }

    #[tokio::test]
    async fn test_initialize_destroys_previous_device() {
        let telephony = MockTelephony::new();
        let mut manager = manager(&telephony);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let forward = {
            let tx = tx.clone();
            move |generation, event| tx.send((generation, event)).is_ok()
        };
        manager.initialize("token-1", forward).await.unwrap();
        let first = telephony.latest_device().unwrap();

        let forward = move |generation, event| tx.send((generation, event)).is_ok();
        manager.initialize("token-2", forward).await.unwrap();
        let second = telephony.latest_device().unwrap();

        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());
        assert_eq!(telephony.device_count(), 2);
        assert_eq!(manager.generation(), 2);
        assert_eq!(second.tokens(), vec!["token-2".to_string()]);

        // the first device's pump is gone, only the live device is heard
        first.emit(DeviceEvent::Registered);
        second.emit(DeviceEvent::TokenWillExpire);
        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 2);
        assert!(matches!(event, DeviceEvent::TokenWillExpire));
    }

    #[tokio::test]
    async fn test_initialize_failure_leaves_initializing() {
        let telephony = MockTelephony::new();
        telephony.fail_next_device_creations(1);
        let mut manager = manager(&telephony);

        assert!(manager.initialize("t", |_, _| true).await.is_err());
        assert_eq!(manager.state(), RegistrationState::Initializing);
        assert!(manager.device().is_none());

        let step = manager
            .apply(RegistrationEvent::RegisterFailed { reason: "construct".into() })
            .unwrap();
        assert_eq!(step.to, RegistrationState::Error);
    }

    #[tokio::test]
    async fn test_destroy() {
        let telephony = MockTelephony::new();
        let mut manager = manager(&telephony);
        manager.initialize("t", |_, _| true).await.unwrap();
        let step = manager.destroy().await.unwrap();
        assert_eq!(step.to, RegistrationState::Uninitialized);
        assert!(telephony.latest_device().unwrap().is_destroyed());
        assert!(manager.update_token("t2").await.is_err());
    }
}
