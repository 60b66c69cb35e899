//! Session manager configuration
//!
//! [`SessionConfig`] holds who the agent is and where the backends live;
//! [`TimingConfig`] holds every timer the session manager arms. Defaults match
//! the production console: 30s answer timeout, 30s heartbeat, 90s staleness,
//! 10s connect timeout, 15 minute token refresh.
//!
//! ```rust
//! use agentdesk_phone_core::config::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::new("agent-42", "client:agent-42")
//!     .with_api_base_url("https://api.example.com")
//!     .with_api_bearer("session-jwt")
//!     .with_signalling_url("wss://routing.example.com/agents");
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.timing.answer_timeout, Duration::from_secs(30));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{PhoneError, PhoneResult};

/// Audio processing constraints passed to the SDK when accepting a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AcceptConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Timer and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long an incoming call may ring before it is auto-rejected
    pub answer_timeout: Duration,
    /// Interval between signalling pings
    pub heartbeat_interval: Duration,
    /// Age of the last inbound signalling message after which the channel is unhealthy
    pub heartbeat_stale_after: Duration,
    /// Deadline for the signalling socket to open
    pub connect_timeout: Duration,
    /// Period of the scheduled token refresh
    pub token_refresh_interval: Duration,
    /// Delay of the single retry after a failed scheduled refresh
    pub token_retry_delay: Duration,
    pub signalling_backoff: Backoff,
    pub registration_backoff: Backoff,
    /// Delay before re-registering after a spontaneous unregistration
    pub reregister_delay: Duration,
    /// Call quality sampling period while a call is active
    pub quality_interval: Duration,
    /// Period at which connection health is re-evaluated
    pub health_check_interval: Duration,
    /// Input level sampling period (roughly one display refresh)
    pub level_sample_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_stale_after: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            token_refresh_interval: Duration::from_secs(15 * 60),
            token_retry_delay: Duration::from_secs(5),
            signalling_backoff: Backoff::signalling(),
            registration_backoff: Backoff::registration(),
            reregister_delay: Duration::from_secs(5),
            quality_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
            level_sample_interval: Duration::from_millis(16),
        }
    }
}

/// Main session manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Agent identifier announced on the signalling channel
    pub agent_id: String,
    /// Telephony identity the token is issued for
    pub identity: String,
    /// Base URL of the REST backend hosting `/telephony/token`
    pub api_base_url: String,
    /// Bearer credential of the logged-in dashboard session
    #[serde(default)]
    pub api_bearer: Option<String>,
    /// WebSocket URL of the call-routing server
    pub signalling_url: String,
    #[serde(default)]
    pub accept_constraints: AcceptConstraints,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl SessionConfig {
    /// Create a configuration with local backend defaults
    pub fn new(agent_id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            identity: identity.into(),
            api_base_url: "http://127.0.0.1:8000".to_string(),
            api_bearer: None,
            signalling_url: "ws://127.0.0.1:8000/ws/agents".to_string(),
            accept_constraints: AcceptConstraints::default(),
            timing: TimingConfig::default(),
        }
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_api_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.api_bearer = Some(bearer.into());
        self
    }

    pub fn with_signalling_url(mut self, url: impl Into<String>) -> Self {
        self.signalling_url = url.into();
        self
    }

    pub fn with_accept_constraints(mut self, constraints: AcceptConstraints) -> Self {
        self.accept_constraints = constraints;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Check the configuration before the session manager starts
    pub fn validate(&self) -> PhoneResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(invalid("agent_id", "cannot be empty"));
        }
        if self.identity.trim().is_empty() {
            return Err(invalid("identity", "cannot be empty"));
        }
        url::Url::parse(&self.api_base_url)
            .map_err(|e| invalid("api_base_url", e.to_string()))?;

        let signalling = url::Url::parse(&self.signalling_url)
            .map_err(|e| invalid("signalling_url", e.to_string()))?;
        if !matches!(signalling.scheme(), "ws" | "wss") {
            return Err(invalid("signalling_url", "scheme must be ws or wss"));
        }

        let timing = &self.timing;
        if timing.heartbeat_interval.is_zero() {
            return Err(invalid("timing.heartbeat_interval", "must be positive"));
        }
        if timing.heartbeat_stale_after <= timing.heartbeat_interval {
            return Err(invalid(
                "timing.heartbeat_stale_after",
                "must be longer than the heartbeat interval",
            ));
        }
        if timing.answer_timeout.is_zero() || timing.connect_timeout.is_zero() {
            return Err(invalid("timing", "timeouts must be positive"));
        }
        if timing.level_sample_interval.is_zero() || timing.health_check_interval.is_zero() {
            return Err(invalid("timing", "sampling intervals must be positive"));
        }

        let periods = [
            ("timing.token_refresh_interval", timing.token_refresh_interval),
            ("timing.token_retry_delay", timing.token_retry_delay),
            ("timing.reregister_delay", timing.reregister_delay),
            ("timing.quality_interval", timing.quality_interval),
            ("timing.signalling_backoff.base", timing.signalling_backoff.base),
            ("timing.registration_backoff.base", timing.registration_backoff.base),
        ];
        for (field, period) in periods {
            if period.is_zero() {
                return Err(invalid(field, "must be positive"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> PhoneError {
    PhoneError::InvalidConfiguration {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::new("agent-1", "agent-1");
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.heartbeat_stale_after, Duration::from_secs(90));
        assert_eq!(config.timing.token_refresh_interval, Duration::from_secs(900));
    }

    #[test]
    fn test_rejects_http_signalling_url() {
        let config = SessionConfig::new("agent-1", "agent-1")
            .with_signalling_url("http://routing.example.com");
        match config.validate() {
            Err(PhoneError::InvalidConfiguration { field, .. }) => assert_eq!(field, "signalling_url"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_empty_agent() {
        let config = SessionConfig::new("  ", "agent-1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_threshold_must_exceed_heartbeat() {
        let mut timing = TimingConfig::default();
        timing.heartbeat_stale_after = Duration::from_secs(30);
        let config = SessionConfig::new("agent-1", "agent-1").with_timing(timing);
        assert!(config.validate().is_err());
    }

    fn rejected_field(timing: TimingConfig) -> String {
        let config = SessionConfig::new("agent-1", "agent-1").with_timing(timing);
        match config.validate() {
            Err(PhoneError::InvalidConfiguration { field, .. }) => field,
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_token_refresh_interval() {
        let mut timing = TimingConfig::default();
        timing.token_refresh_interval = Duration::ZERO;
        assert_eq!(rejected_field(timing), "timing.token_refresh_interval");
    }

    #[test]
    fn test_rejects_zero_token_retry_delay() {
        let mut timing = TimingConfig::default();
        timing.token_retry_delay = Duration::ZERO;
        assert_eq!(rejected_field(timing), "timing.token_retry_delay");
    }

    #[test]
    fn test_rejects_zero_reregister_delay() {
        let mut timing = TimingConfig::default();
        timing.reregister_delay = Duration::ZERO;
        assert_eq!(rejected_field(timing), "timing.reregister_delay");
    }

    #[test]
    fn test_rejects_zero_quality_interval() {
        let mut timing = TimingConfig::default();
        timing.quality_interval = Duration::ZERO;
        assert_eq!(rejected_field(timing), "timing.quality_interval");
    }

    #[test]
    fn test_rejects_zero_backoff_bases() {
        let mut timing = TimingConfig::default();
        timing.signalling_backoff = Backoff::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(rejected_field(timing), "timing.signalling_backoff.base");

        let mut timing = TimingConfig::default();
        timing.registration_backoff = Backoff::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(rejected_field(timing), "timing.registration_backoff.base");
    }

    #[test]
    fn test_json_with_partial_timing() {
        let json = r#"{
            "agent_id": "a-7",
            "identity": "client:a-7",
            "api_base_url": "https://api.example.com",
            "signalling_url": "wss://routing.example.com/ws",
            "timing": { "answer_timeout": { "secs": 20, "nanos": 0 } }
        }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timing.answer_timeout, Duration::from_secs(20));
        assert_eq!(config.timing.heartbeat_interval, Duration::from_secs(30));
        assert!(config.accept_constraints.echo_cancellation);
        assert!(config.api_bearer.is_none());
    }
}
