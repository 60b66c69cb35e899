//! Signalling transports
//!
//! A [`SignallingTransport`] opens one connection and hands back a
//! [`SignallingLink`]: a sender for outbound frames and a receiver for inbound
//! events. The link owns no state machine; reconnect policy lives in
//! [`super::channel::SignallingChannel`].
//!
//! - [`WsTransport`] talks WebSocket through `tokio-tungstenite`
//! - [`MemoryTransport`] connects to an in-process peer, for tests and the
//!   simulated console

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use crate::error::{PhoneError, PhoneResult};

/// Normal closure, the only code that does not trigger a reconnect
pub const CLOSE_NORMAL: u16 = 1000;

/// Reported when the connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Frame queued for the remote end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Event observed on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    /// The link is gone; no further events follow
    Closed { code: u16, reason: String },
}

/// One open signalling connection
#[derive(Debug)]
pub struct SignallingLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens signalling connections
#[async_trait]
pub trait SignallingTransport: Send + Sync {
    /// Resolve once the connection is open
    async fn connect(&self, url: &str) -> PhoneResult<SignallingLink>;
}

/// WebSocket transport
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignallingTransport for WsTransport {
    async fn connect(&self, url: &str) -> PhoneResult<SignallingLink> {
        let (stream, response) = tokio_tungstenite::connect_async(url).await?;
        debug!(url = %url, status = %response.status(), "Signalling WebSocket open");

        let (mut writer, mut reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame {
                    OutboundFrame::Text(text) => WsMessage::Text(text),
                    OutboundFrame::Close { code, reason } => {
                        let close = WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        }));
                        if let Err(e) = writer.send(close).await {
                            debug!(error = %e, "Failed to send close frame");
                        }
                        let _ = writer.close().await;
                        break;
                    }
                };
                if let Err(e) = writer.send(message).await {
                    warn!(error = %e, "Signalling send failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let closed = loop {
                match reader.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx.send(LinkEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        let Some(text) = binary_frame_text(data) else {
                            continue;
                        };
                        if in_tx.send(LinkEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => LinkEvent::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.into_owned(),
                            },
                            // no status code present
                            None => LinkEvent::Closed {
                                code: 1005,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(other)) => trace!(?other, "Ignoring control frame"),
                    Some(Err(e)) => {
                        break LinkEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        }
                    }
                    None => {
                        break LinkEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended".to_string(),
                        }
                    }
                }
            };
            let _ = in_tx.send(closed);
        });

        Ok(SignallingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Text carried by a binary frame; frames that are not UTF-8 are dropped
fn binary_frame_text(data: Vec<u8>) -> Option<String> {
    match String::from_utf8(data) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!(len = e.as_bytes().len(), "Dropping non-UTF-8 binary signalling frame");
            None
        }
    }
}

#[derive(Debug)]
enum ConnectBehaviour {
    Fail(PhoneError),
    Hang,
}

#[derive(Debug, Default)]
struct MemoryState {
    scripted: VecDeque<ConnectBehaviour>,
    attempts: u32,
    peers: Vec<MemoryPeer>,
}

/// In-process transport
///
/// Every successful connect creates a [`MemoryPeer`] standing in for the
/// routing server. Attempts can be scripted to fail or to never open.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next connect attempt fail with `error`
    pub fn fail_next(&self, error: PhoneError) {
        self.state.lock().scripted.push_back(ConnectBehaviour::Fail(error));
    }

    /// Make the next connect attempt never complete
    pub fn hang_next(&self) {
        self.state.lock().scripted.push_back(ConnectBehaviour::Hang);
    }

    /// Number of connect attempts, successful or not
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    pub fn peers(&self) -> Vec<MemoryPeer> {
        self.state.lock().peers.clone()
    }

    /// Server side of the most recent connection
    pub fn latest_peer(&self) -> Option<MemoryPeer> {
        self.state.lock().peers.last().cloned()
    }
}

#[async_trait]
impl SignallingTransport for MemoryTransport {
    async fn connect(&self, url: &str) -> PhoneResult<SignallingLink> {
        let behaviour = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.scripted.pop_front()
        };
        match behaviour {
            Some(ConnectBehaviour::Fail(err)) => return Err(err),
            Some(ConnectBehaviour::Hang) => futures::future::pending::<()>().await,
            None => {}
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            to_client: in_tx,
            received: Arc::new(Mutex::new(Vec::new())),
        };

        let received = peer.received.clone();
        let to_client = peer.to_client.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let close = match &frame {
                    OutboundFrame::Close { code, reason } => Some((*code, reason.clone())),
                    OutboundFrame::Text(_) => None,
                };
                received.lock().push(frame);
                if let Some((code, reason)) = close {
                    // the server echoes the close handshake
                    let _ = to_client.send(LinkEvent::Closed { code, reason });
                    break;
                }
            }
        });

        self.state.lock().peers.push(peer);
        Ok(SignallingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Server end of a [`MemoryTransport`] connection
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    url: String,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    received: Arc<Mutex<Vec<OutboundFrame>>>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a text frame to the client
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Text(text.into())).is_ok()
    }

    /// Drop the connection with the given close code
    pub fn close(&self, code: u16) -> bool {
        self.to_client
            .send(LinkEvent::Closed {
                code,
                reason: String::new(),
            })
            .is_ok()
    }

    /// Every frame the client sent, in order
    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.received.lock().clone()
    }

    /// Text frames parsed as JSON
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|f| match f {
                OutboundFrame::Text(text) => serde_json::from_str(&text).ok(),
                OutboundFrame::Close { .. } => None,
            })
            .collect()
    }

    /// Text frames whose `type` equals `kind`
    pub fn sent_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.sent_json()
            .into_iter()
            .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_frames_must_be_utf8() {
        assert_eq!(
            binary_frame_text(br#"{"type":"pong"}"#.to_vec()).as_deref(),
            Some(r#"{"type":"pong"}"#)
        );
        assert_eq!(binary_frame_text(vec![0x7b, 0xff, 0xfe, 0x7d]), None);
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let transport = MemoryTransport::new();
        let mut link = transport.connect("ws://routing.test/agents").await.unwrap();
        let peer = transport.latest_peer().unwrap();
        assert_eq!(peer.url(), "ws://routing.test/agents");

        link.outbound.send(OutboundFrame::Text(r#"{"type":"ping"}"#.into())).unwrap();
        peer.push_text(r#"{"type":"pong"}"#);
        assert_eq!(link.inbound.recv().await, Some(LinkEvent::Text(r#"{"type":"pong"}"#.into())));

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(peer.sent_of_type("ping").len(), 1);
    }

    #[tokio::test]
    async fn test_memory_close_is_echoed() {
        let transport = MemoryTransport::new();
        let mut link = transport.connect("ws://routing.test").await.unwrap();
        link.outbound
            .send(OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "bye".into(),
            })
            .unwrap();
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Closed {
                code: CLOSE_NORMAL,
                reason: "bye".into()
            })
        );
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let transport = MemoryTransport::new();
        transport.fail_next(PhoneError::network("refused"));
        assert!(transport.connect("ws://routing.test").await.is_err());
        assert!(transport.connect("ws://routing.test").await.is_ok());
        assert_eq!(transport.attempts(), 2);
    }
}
