//! Call session data
//!
//! [`CallSession`] is the live record owned by the call state machine;
//! everything outside the machine sees [`CallSnapshot`] copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::telephony::CallQualityMetrics;

/// Identifier of one call, assigned when the session is created
pub type CallId = Uuid;

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call
    None,
    /// Ringing, waiting for the agent
    Incoming,
    /// Answered (or dialed) and in progress
    Active,
    /// The call just finished; reported in transitions, never a resting state
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::None => write!(f, "none"),
            CallState::Incoming => write!(f, "incoming"),
            CallState::Active => write!(f, "active"),
            CallState::Ended => write!(f, "ended"),
        }
    }
}

/// Coarse call audio health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl CallQuality {
    /// Classify an SDK quality sample by its MOS
    ///
    /// Returns `None` when the sample carries no MOS.
    pub fn from_metrics(metrics: &CallQualityMetrics) -> Option<Self> {
        metrics.mos_score.map(|mos| match mos {
            m if m >= 4.0 => CallQuality::Excellent,
            m if m >= 3.5 => CallQuality::Good,
            m if m >= 3.0 => CallQuality::Fair,
            _ => CallQuality::Poor,
        })
    }
}

impl fmt::Display for CallQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallQuality::Excellent => write!(f, "excellent"),
            CallQuality::Good => write!(f, "good"),
            CallQuality::Fair => write!(f, "fair"),
            CallQuality::Poor => write!(f, "poor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Why a call left the machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The agent declined the incoming call
    Rejected,
    /// The caller hung up before it was answered
    Cancelled,
    /// Nobody answered within the answer timeout
    AnswerTimeout,
    /// The agent hung up
    LocalHangup,
    /// The other side hung up
    RemoteHangup,
    Failed { message: String },
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Rejected => write!(f, "rejected"),
            EndReason::Cancelled => write!(f, "cancelled"),
            EndReason::AnswerTimeout => write!(f, "answer timeout"),
            EndReason::LocalHangup => write!(f, "local hangup"),
            EndReason::RemoteHangup => write!(f, "remote hangup"),
            EndReason::Failed { message } => write!(f, "failed: {}", message),
        }
    }
}

/// The live call
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub id: CallId,
    pub state: CallState,
    pub remote_identity: String,
    pub direction: CallDirection,
    /// Seconds spent ACTIVE
    pub duration_seconds: u64,
    pub quality: CallQuality,
    /// Media is flowing
    pub connected: bool,
    pub muted: bool,
    pub created_at: DateTime<Utc>,
    pub(crate) warnings: BTreeSet<String>,
    pub(crate) quality_before_warnings: Option<CallQuality>,
}

impl CallSession {
    pub(crate) fn new(id: CallId, remote_identity: String, direction: CallDirection, state: CallState) -> Self {
        Self {
            id,
            state,
            remote_identity,
            direction,
            duration_seconds: 0,
            quality: CallQuality::Excellent,
            connected: false,
            muted: false,
            created_at: Utc::now(),
            warnings: BTreeSet::new(),
            quality_before_warnings: None,
        }
    }

    /// SDK warnings currently raised
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }
}

/// Immutable view of the call for presentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<CallId>,
    pub remote_identity: Option<String>,
    pub direction: Option<CallDirection>,
    pub duration_seconds: u64,
    pub quality: Option<CallQuality>,
    pub connected: bool,
    pub muted: bool,
    pub warnings: Vec<String>,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            state: CallState::None,
            call_id: None,
            remote_identity: None,
            direction: None,
            duration_seconds: 0,
            quality: None,
            connected: false,
            muted: false,
            warnings: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == CallState::None
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

impl From<&CallSession> for CallSnapshot {
    fn from(session: &CallSession) -> Self {
        Self {
            state: session.state,
            call_id: Some(session.id),
            remote_identity: Some(session.remote_identity.clone()),
            direction: Some(session.direction),
            duration_seconds: session.duration_seconds,
            quality: Some(session.quality),
            connected: session.connected,
            muted: session.muted,
            warnings: session.warnings.iter().cloned().collect(),
        }
    }
}
