//! Signalling channel to the call-routing server
//!
//! This connection is the console's own presence link, separate from the
//! telephony SDK's transport. It announces the agent after every (re)connect,
//! pushes availability changes, and keeps a heartbeat so a socket that is open
//! but silently dead is noticed.
//!
//! - [`message`] - JSON wire format
//! - [`transport`] - WebSocket and in-memory transports
//! - [`channel`] - state machine, reconnect policy and health

pub mod channel;
pub mod message;
pub mod transport;

pub use channel::{ChannelAction, ChannelEvent, ChannelStep, SignallingChannel, SignallingState};
pub use message::{AgentStatus, InboundMessage, OutboundMessage};
pub use transport::{
    LinkEvent, MemoryPeer, MemoryTransport, OutboundFrame, SignallingLink, SignallingTransport, WsTransport,
    CLOSE_ABNORMAL, CLOSE_NORMAL,
};
