//! Signalling wire format
//!
//! Every frame is a JSON text message with a `type` discriminator. Outbound
//! messages carry their payload under `data`:
//!
//! ```json
//! {"type":"agent_register","data":{"agent_id":"a-7","token":"..."}}
//! {"type":"ping"}
//! {"type":"status_update","data":{"agent_id":"a-7","status":"free"}}
//! ```
//!
//! Inbound messages are only inspected for their `type`; unknown types parse
//! to [`InboundMessage::Unknown`] so new server messages never break the
//! connection.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PhoneError, PhoneResult};

/// Agent availability pushed to the routing server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Free,
    Busy,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Free => write!(f, "free"),
            AgentStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Messages sent to the routing server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    AgentRegister { agent_id: String, token: String },
    Ping,
    StatusUpdate { agent_id: String, status: AgentStatus },
}

impl OutboundMessage {
    pub fn to_json(&self) -> PhoneResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::AgentRegister { .. } => "agent_register",
            OutboundMessage::Ping => "ping",
            OutboundMessage::StatusUpdate { .. } => "status_update",
        }
    }
}

/// Messages received from the routing server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    RegistrationSuccess,
    RegistrationError {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    Pong,
    /// Advisory; call state is driven by the telephony SDK
    IncomingCall {
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// Advisory; call state is driven by the telephony SDK
    CallEnded {
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> PhoneResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| PhoneError::protocol(format!("malformed signalling message: {}", e)))
    }

    /// Human-readable reason carried by a `registration_error`
    pub fn error_reason(&self) -> Option<String> {
        match self {
            InboundMessage::RegistrationError { message, data } => Some(
                message
                    .clone()
                    .or_else(|| {
                        data.as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "agent registration rejected".to_string()),
            ),
            _ => None,
        }
    }
}
