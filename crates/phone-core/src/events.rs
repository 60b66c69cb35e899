//! Ephemeral notices and desktop notifications
//!
//! [`SessionNotice`] values are broadcast to every listener and meant to be
//! shown briefly ("call cancelled", "quality degraded") then dismissed. The
//! persistent status line is part of the session snapshot instead.
//!
//! [`Notifier`] is the seam to the platform notification centre used to alert
//! the agent about a ringing call while the console is in the background.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::call::{CallId, CallQuality, EndReason};

/// Notice severity, used to pick styling and dismissal time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Short-lived notice for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionNotice {
    IncomingCall { call_id: CallId, remote_identity: String },
    CallCancelled { remote_identity: String },
    /// Auto-rejected after the answer timeout
    MissedCall { remote_identity: String },
    CallEnded { call_id: CallId, duration_seconds: u64, reason: EndReason },
    CallFailed { message: String },
    QualityDegraded { warning: String },
    QualityRestored { quality: CallQuality },
    /// The routing server accepted the agent announcement
    AgentRegistered,
    /// The routing server refused the agent announcement
    RegistrationError { message: String },
    TokenRefreshFailed { message: String },
    MicrophoneDenied { message: String },
    Error { category: String, message: String },
}

impl SessionNotice {
    pub fn level(&self) -> NoticeLevel {
        match self {
            SessionNotice::IncomingCall { .. }
            | SessionNotice::CallEnded { .. }
            | SessionNotice::QualityRestored { .. }
            | SessionNotice::AgentRegistered => NoticeLevel::Info,
            SessionNotice::CallCancelled { .. }
            | SessionNotice::MissedCall { .. }
            | SessionNotice::QualityDegraded { .. }
            | SessionNotice::TokenRefreshFailed { .. } => NoticeLevel::Warning,
            SessionNotice::CallFailed { .. }
            | SessionNotice::RegistrationError { .. }
            | SessionNotice::MicrophoneDenied { .. }
            | SessionNotice::Error { .. } => NoticeLevel::Error,
        }
    }

    /// One-line text for display
    pub fn message(&self) -> String {
        match self {
            SessionNotice::IncomingCall { remote_identity, .. } => format!("Incoming call from {}", remote_identity),
            SessionNotice::CallCancelled { remote_identity } => format!("Call from {} was cancelled", remote_identity),
            SessionNotice::MissedCall { remote_identity } => format!("Missed call from {}", remote_identity),
            SessionNotice::CallEnded { duration_seconds, .. } => {
                format!("Call ended after {}:{:02}", duration_seconds / 60, duration_seconds % 60)
            }
            SessionNotice::CallFailed { message } => format!("Call failed: {}", message),
            SessionNotice::QualityDegraded { warning } => format!("Call quality degraded ({})", warning),
            SessionNotice::QualityRestored { quality } => format!("Call quality restored ({})", quality),
            SessionNotice::AgentRegistered => "Connected to call routing".to_string(),
            SessionNotice::RegistrationError { message } => format!("Agent registration failed: {}", message),
            SessionNotice::TokenRefreshFailed { message } => format!("Token refresh failed: {}", message),
            SessionNotice::MicrophoneDenied { message } => format!("Microphone unavailable: {}", message),
            SessionNotice::Error { category, message } => format!("{} error: {}", category, message),
        }
    }
}

/// Platform notification centre
pub trait Notifier: Send + Sync {
    /// Whether the user previously allowed notifications
    fn permission_granted(&self) -> bool;

    /// Show an "incoming call" notification
    fn notify_incoming(&self, remote_identity: &str);
}

/// Notifier that writes to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier {
    granted: bool,
}

impl LogNotifier {
    pub fn new(granted: bool) -> Self {
        Self { granted }
    }
}

impl Notifier for LogNotifier {
    fn permission_granted(&self) -> bool {
        self.granted
    }

    fn notify_incoming(&self, remote_identity: &str) {
        info!(remote = %remote_identity, "Incoming call notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(
            SessionNotice::CallCancelled { remote_identity: "+1555".into() }.level(),
            NoticeLevel::Warning
        );
        assert_eq!(SessionNotice::AgentRegistered.level(), NoticeLevel::Info);
        assert_eq!(
            SessionNotice::MicrophoneDenied { message: "denied".into() }.level(),
            NoticeLevel::Error
        );
    }

    #[test]
    fn test_call_ended_message_formats_duration() {
        let notice = SessionNotice::CallEnded {
            call_id: CallId::nil(),
            duration_seconds: 125,
            reason: EndReason::LocalHangup,
        };
        assert_eq!(notice.message(), "Call ended after 2:05");
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_value(SessionNotice::MissedCall { remote_identity: "+1555".into() }).unwrap();
        assert_eq!(json["kind"], "missed_call");
        assert_eq!(json["remote_identity"], "+1555");
    }
}
