//! Access token retrieval and refresh planning
//!
//! The telephony device and the signalling handshake both authenticate with a
//! short-lived access token issued by the backend. [`TokenProvider`] is the
//! seam to the token endpoint; [`HttpTokenProvider`] is the production
//! implementation. [`CredentialRefresher`] holds the live [`Credential`] and
//! decides, for every fetch outcome, whether the periodic refresh timer is
//! rearmed, retried once, or left alone.
//!
//! # Refresh policy
//!
//! | Trigger            | Success              | Failure                               |
//! |--------------------|----------------------|---------------------------------------|
//! | `Initial`          | rearm periodic timer | caller retries through backoff        |
//! | `Scheduled`        | rearm periodic timer | one retry after `token_retry_delay`   |
//! | `ScheduledRetry`   | rearm periodic timer | give up, keep old token, rearm period |
//! | `TokenWillExpire`  | nothing              | nothing                               |
//! | `RegistrationRetry`| nothing              | caller retries through backoff        |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{PhoneError, PhoneResult};

/// A short-lived access token
///
/// Replaced wholesale on every refresh. The token itself never appears in
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Source of access tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a fresh token for the given telephony identity
    async fn fetch_token(&self, identity: &str) -> PhoneResult<Credential>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches tokens from `GET {base}/telephony/token?identity=<id>`
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    base_url: String,
    bearer: Option<String>,
    http: reqwest::Client,
}

impl HttpTokenProvider {
    pub fn new(base_url: &str, bearer: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer,
            http: reqwest::Client::new(),
        }
    }

    fn token_url(&self, identity: &str) -> PhoneResult<url::Url> {
        let mut url = url::Url::parse(&format!("{}/telephony/token", self.base_url))
            .map_err(|e| PhoneError::InvalidConfiguration {
                field: "api_base_url".to_string(),
                reason: e.to_string(),
            })?;
        url.query_pairs_mut().append_pair("identity", identity);
        Ok(url)
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self, identity: &str) -> PhoneResult<Credential> {
        let bearer = self
            .bearer
            .as_deref()
            .ok_or_else(|| PhoneError::auth("no dashboard session available"))?;
        if identity.is_empty() {
            return Err(PhoneError::auth("no telephony identity available"));
        }

        let url = self.token_url(identity)?;
        debug!(url = %url, "Fetching telephony token");

        let response = self.http.get(url).bearer_auth(bearer).send().await?;
        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(PhoneError::Server {
                status: status.as_u16(),
                reason,
            });
        }

        let body: TokenResponse = response.json().await?;
        if body.token.is_empty() {
            return Err(PhoneError::protocol("token endpoint returned an empty token"));
        }
        Ok(Credential::new(body.token))
    }
}

/// Why a token fetch was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// First fetch at boot (and its backoff retries)
    Initial,
    /// The periodic refresh timer fired
    Scheduled,
    /// The single retry after a failed scheduled refresh
    ScheduledRetry,
    /// The telephony SDK announced the token is about to expire
    TokenWillExpire,
    /// Registration failed and is retried with a fresh token
    RegistrationRetry,
}

/// What the caller should do with the refresh timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Arm the periodic refresh timer with this delay
    Rearm(Duration),
    /// Arm the one-shot retry timer with this delay
    RetryIn(Duration),
    Nothing,
}

/// Holds the live credential and plans refresh timers
#[derive(Debug)]
pub struct CredentialRefresher {
    current: Option<Credential>,
    refresh_interval: Duration,
    retry_delay: Duration,
}

impl CredentialRefresher {
    pub fn new(refresh_interval: Duration, retry_delay: Duration) -> Self {
        Self {
            current: None,
            refresh_interval,
            retry_delay,
        }
    }

    /// The live credential, if one was ever fetched
    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.current.as_ref().map(Credential::token)
    }

    /// Record a fetched credential and plan the next refresh
    pub fn on_fetched(&mut self, trigger: RefreshTrigger, credential: Credential) -> RefreshPlan {
        debug!(?trigger, issued_at = %credential.issued_at(), "Access token replaced");
        self.current = Some(credential);
        match trigger {
            RefreshTrigger::Initial | RefreshTrigger::Scheduled | RefreshTrigger::ScheduledRetry => {
                RefreshPlan::Rearm(self.refresh_interval)
            }
            RefreshTrigger::TokenWillExpire | RefreshTrigger::RegistrationRetry => RefreshPlan::Nothing,
        }
    }

    /// Plan the reaction to a failed fetch; the previous credential stays live
    pub fn on_failed(&mut self, trigger: RefreshTrigger, err: &PhoneError) -> RefreshPlan {
        match trigger {
            RefreshTrigger::Scheduled if !err.is_recoverable() => {
                error!(
                    error = %err,
                    category = err.category(),
                    "Scheduled token refresh refused, waiting for next cycle"
                );
                RefreshPlan::Rearm(self.refresh_interval)
            }
            RefreshTrigger::Scheduled => {
                warn!(
                    error = %err,
                    retry_ms = self.retry_delay.as_millis() as u64,
                    "Scheduled token refresh failed, retrying once"
                );
                RefreshPlan::RetryIn(self.retry_delay)
            }
            RefreshTrigger::ScheduledRetry => {
                error!(
                    error = %err,
                    has_token = self.current.is_some(),
                    "Token refresh retry failed, keeping previous token until next cycle"
                );
                RefreshPlan::Rearm(self.refresh_interval)
            }
            RefreshTrigger::TokenWillExpire => {
                warn!(error = %err, "Best-effort token refresh failed");
                RefreshPlan::Nothing
            }
            RefreshTrigger::Initial | RefreshTrigger::RegistrationRetry => RefreshPlan::Nothing,
        }
    }
}
