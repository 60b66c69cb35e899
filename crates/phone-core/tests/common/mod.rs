//! Shared harness for the session scenario tests
//!
//! Every backend is simulated and the tests run on tokio's paused clock, so
//! backoff delays and heartbeat staleness play out instantly.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use agentdesk_phone_core::audio::MockMediaBackend;
use agentdesk_phone_core::signalling::{MemoryPeer, MemoryTransport};
use agentdesk_phone_core::telephony::{MockDevice, MockTelephony};
use agentdesk_phone_core::{
    Credential, Notifier, PhoneError, PhoneResult, SessionConfig, SessionDeps, SessionHandle, SessionManager,
    SessionNotice, TokenProvider,
};

pub const AGENT_ID: &str = "agent-7";

/// Token issuer that numbers its tokens and fails on demand
#[derive(Debug, Default)]
pub struct ScriptedTokens {
    failures: Mutex<VecDeque<PhoneError>>,
    fetches: Mutex<Vec<Instant>>,
}

impl ScriptedTokens {
    /// Fail the next fetches with the given errors, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = PhoneError>) {
        self.failures.lock().extend(errors);
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetches.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }
}

#[async_trait]
impl TokenProvider for ScriptedTokens {
    async fn fetch_token(&self, _identity: &str) -> PhoneResult<Credential> {
        let number = {
            let mut fetches = self.fetches.lock();
            fetches.push(Instant::now());
            fetches.len()
        };
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(Credential::new(format!("token-{}", number)))
    }
}

/// Notifier that remembers what it showed
#[derive(Debug)]
pub struct RecordingNotifier {
    granted: bool,
    shown: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new(granted: bool) -> Self {
        Self {
            granted,
            shown: Mutex::new(Vec::new()),
        }
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn permission_granted(&self) -> bool {
        self.granted
    }

    fn notify_incoming(&self, remote_identity: &str) {
        self.shown.lock().push(remote_identity.to_string());
    }
}

/// Simulated backends, scriptable before the session starts
pub struct HarnessBuilder {
    pub config: SessionConfig,
    pub telephony: MockTelephony,
    pub transport: MemoryTransport,
    pub media: MockMediaBackend,
    pub tokens: Arc<ScriptedTokens>,
    pub notifier: Arc<RecordingNotifier>,
}

impl HarnessBuilder {
    /// Start the session and let the boot sequence run
    pub async fn start(self) -> Harness {
        let deps = SessionDeps {
            telephony: Arc::new(self.telephony.clone()),
            tokens: self.tokens.clone(),
            transport: Arc::new(self.transport.clone()),
            media: Arc::new(self.media.clone()),
            notifier: self.notifier.clone(),
        };
        let session = SessionManager::start(self.config, deps).expect("valid config");
        // subscribe before the session task first runs so boot notices are kept
        let notices = session.notices();
        let harness = Harness {
            session,
            notices,
            telephony: self.telephony,
            transport: self.transport,
            media: self.media,
            tokens: self.tokens,
            notifier: self.notifier,
        };
        settle().await;
        harness
    }
}

/// A running session and its simulated backends
pub struct Harness {
    pub session: SessionHandle,
    pub notices: broadcast::Receiver<SessionNotice>,
    pub telephony: MockTelephony,
    pub transport: MemoryTransport,
    pub media: MockMediaBackend,
    pub tokens: Arc<ScriptedTokens>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: SessionConfig::new(AGENT_ID, "agent-7@desk")
                .with_signalling_url("ws://routing.test/ws/agents"),
            telephony: MockTelephony::new(),
            transport: MemoryTransport::new(),
            media: MockMediaBackend::new(),
            tokens: Arc::new(ScriptedTokens::default()),
            notifier: Arc::new(RecordingNotifier::new(true)),
        }
    }

    pub async fn start() -> Self {
        Self::builder().start().await
    }

    /// Start and complete the agent announcement handshake
    pub async fn start_registered() -> Self {
        let harness = Self::start().await;
        harness.peer().push_text(r#"{"type":"registration_success"}"#);
        settle().await;
        harness
    }

    pub fn peer(&self) -> MemoryPeer {
        self.transport.latest_peer().expect("signalling connected")
    }

    pub fn device(&self) -> Arc<MockDevice> {
        self.telephony.latest_device().expect("device created")
    }

    /// Agent statuses published so far, oldest first
    pub fn published_statuses(&self) -> Vec<String> {
        self.transport
            .peers()
            .iter()
            .flat_map(|peer| peer.sent_of_type("status_update"))
            .filter_map(|msg| msg["data"]["status"].as_str().map(str::to_string))
            .collect()
    }

    /// Notices received since the last drain
    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        let mut drained = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            drained.push(notice);
        }
        drained
    }
}

/// Let every ready task run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub async fn advance(by: Duration) {
    tokio::time::sleep(by).await;
}

pub fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}
