//! Offline stand-ins for the token endpoint and the routing server

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agentdesk_phone_core::signalling::MemoryTransport;
use agentdesk_phone_core::{Credential, PhoneResult, TokenProvider};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

/// Issues numbered tokens without a backend
#[derive(Debug, Default)]
pub struct SimulatedTokens {
    issued: AtomicU64,
}

#[async_trait]
impl TokenProvider for SimulatedTokens {
    async fn fetch_token(&self, identity: &str) -> PhoneResult<Credential> {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(identity = %identity, n, "Issuing simulated token");
        Ok(Credential::new(format!("sim-token-{}", n)))
    }
}

/// Answer announcements and pings on every in-memory connection
///
/// Polls the peers of `transport` and replies the way the routing server
/// does: `registration_success` to `agent_register`, `pong` to `ping`.
pub fn spawn_routing_server(transport: MemoryTransport, poll: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut handled: Vec<usize> = Vec::new();
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            for (index, peer) in transport.peers().into_iter().enumerate() {
                if handled.len() <= index {
                    handled.resize(index + 1, 0);
                }
                let frames = peer.sent_json();
                for frame in frames.iter().skip(handled[index]) {
                    let reply = match frame.get("type").and_then(|t| t.as_str()) {
                        Some("agent_register") => Some(r#"{"type":"registration_success"}"#),
                        Some("ping") => Some(r#"{"type":"pong"}"#),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        peer.push_text(reply);
                    }
                }
                handled[index] = frames.len();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentdesk_phone_core::signalling::{LinkEvent, OutboundFrame, SignallingTransport};

    #[tokio::test]
    async fn test_tokens_are_numbered() {
        let tokens = SimulatedTokens::default();
        assert_eq!(tokens.fetch_token("agent").await.unwrap().token(), "sim-token-1");
        assert_eq!(tokens.fetch_token("agent").await.unwrap().token(), "sim-token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_server_answers_register_and_ping() {
        let transport = MemoryTransport::new();
        let server = spawn_routing_server(transport.clone(), Duration::from_millis(100));
        let mut link = transport.connect("ws://routing.local/agents").await.unwrap();

        link.outbound
            .send(OutboundFrame::Text(r#"{"type":"agent_register","data":{"agent_id":"a","token":"t"}}"#.into()))
            .unwrap();
        link.outbound.send(OutboundFrame::Text(r#"{"type":"ping"}"#.into())).unwrap();

        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Text(r#"{"type":"registration_success"}"#.into()))
        );
        assert_eq!(link.inbound.recv().await, Some(LinkEvent::Text(r#"{"type":"pong"}"#.into())));
        server.abort();
    }
}
