//! Session Orchestrator
//!
//! The [`SessionManager`] composes every other component of the crate into a
//! single inbound-call session for one agent. It owns all of them inside one
//! task, so no lock is held across a state transition and every state change
//! is serialized with every other.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐   commands    ┌────────────────────────────────────┐
//! │    SessionHandle    │──────────────▶│            session task            │
//! │ (clonable, any task)│◀──────────────│                                    │
//! └─────────────────────┘ watch/broadcast│  CredentialRefresher               │
//!                                        │  DeviceRegistrationManager         │
//!   ┌──────────────┐   SessionEvent      │  SignallingChannel                 │
//!   │ spawned I/O  │────────────────────▶│  CallSessionMachine                │
//!   │ token fetch  │                     │  AudioDeviceMonitor                │
//!   │ register     │   TimerFired        │  Timers                            │
//!   │ ws connect   │────────────────────▶│                                    │
//!   │ mic request  │                     └────────────────────────────────────┘
//!   └──────────────┘
//! ```
//!
//! Slow network operations run on spawned tasks and post their result back as
//! an event tagged with the generation, attempt or link they belong to. A result
//! for something that has since been replaced is dropped on arrival. Local SDK
//! call control (accept, reject, mute) is awaited inline.
//!
//! After every command, event and timer fire a fresh [`SessionSnapshot`] is
//! published on a `watch` channel; user-facing [`SessionNotice`]s go out on a
//! `broadcast` channel.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentdesk_phone_core::audio::MockMediaBackend;
//! use agentdesk_phone_core::credential::HttpTokenProvider;
//! use agentdesk_phone_core::events::LogNotifier;
//! use agentdesk_phone_core::manager::{SessionDeps, SessionManager};
//! use agentdesk_phone_core::signalling::WsTransport;
//! use agentdesk_phone_core::telephony::MockTelephony;
//! use agentdesk_phone_core::SessionConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("agent-7", "agent-7@desk");
//! let deps = SessionDeps {
//!     telephony: Arc::new(MockTelephony::new()),
//!     tokens: Arc::new(HttpTokenProvider::new(&config.api_base_url, None)),
//!     transport: Arc::new(WsTransport::new()),
//!     media: Arc::new(MockMediaBackend::new()),
//!     notifier: Arc::new(LogNotifier::new(true)),
//! };
//!
//! let session = SessionManager::start(config, deps)?;
//! let mut updates = session.subscribe();
//! while updates.changed().await.is_ok() {
//!     let snapshot = updates.borrow().clone();
//!     if snapshot.call.state == agentdesk_phone_core::call::CallState::Incoming {
//!         session.accept().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod actor;
mod calls;
mod media;
mod network;
mod snapshot;

pub use snapshot::SessionSnapshot;

use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::info;

use crate::audio::MediaBackend;
use crate::config::SessionConfig;
use crate::credential::TokenProvider;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{Notifier, SessionNotice};
use crate::signalling::SignallingTransport;
use crate::telephony::TelephonyConnector;

use actor::{Command, SessionActor};

/// Bound of the command queue between handles and the session task
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Notices buffered for slow subscribers before they start lagging
const NOTICE_CAPACITY: usize = 128;

/// Backends the session talks to
pub struct SessionDeps {
    /// Telephony SDK
    pub telephony: Arc<dyn TelephonyConnector>,
    /// Issuer of telephony access tokens
    pub tokens: Arc<dyn TokenProvider>,
    /// Opens the call-routing WebSocket
    pub transport: Arc<dyn SignallingTransport>,
    /// Microphone capture and device enumeration
    pub media: Arc<dyn MediaBackend>,
    /// Desktop notifications
    pub notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for SessionDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDeps").finish_non_exhaustive()
    }
}

/// Entry point of the session orchestrator
#[derive(Debug)]
pub struct SessionManager;

impl SessionManager {
    /// Validate `config` and spawn the session task
    ///
    /// The task immediately requests the microphone, enumerates audio devices
    /// and fetches the first access token; the device and the signalling
    /// channel follow once the token arrives. Must be called from within a
    /// tokio runtime.
    pub fn start(config: SessionConfig, deps: SessionDeps) -> PhoneResult<SessionHandle> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::initial());
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        info!(agent_id = %config.agent_id, identity = %config.identity, "Starting agent phone session");
        let (actor, inbox) = SessionActor::new(config, deps, snapshot_tx, notice_tx.clone());
        tokio::spawn(actor.run(command_rx, inbox));

        Ok(SessionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            notices: notice_tx,
        })
    }
}

/// Clonable handle to a running session
///
/// Every user action is a request to the session task and resolves once the
/// task has applied it. Errors are returned to the caller and also surfaced as
/// notices; none of them ends the session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    /// Answer the ringing call
    pub async fn accept(&self) -> PhoneResult<()> {
        self.request(Command::Accept).await
    }

    /// Decline the ringing call
    pub async fn reject(&self) -> PhoneResult<()> {
        self.request(Command::Reject).await
    }

    /// Hang up the active call; a ringing call is rejected
    pub async fn end(&self) -> PhoneResult<()> {
        self.request(Command::End).await
    }

    pub async fn toggle_mute(&self) -> PhoneResult<()> {
        self.request(Command::ToggleMute).await
    }

    /// Place an outbound call
    pub async fn dial(&self, to: impl Into<String>) -> PhoneResult<()> {
        let to = to.into();
        self.request(|reply| Command::Dial { to, reply }).await
    }

    pub async fn select_input(&self, device_id: impl Into<String>) -> PhoneResult<()> {
        let device_id = device_id.into();
        self.request(|reply| Command::SelectInput { device_id, reply }).await
    }

    pub async fn select_output(&self, device_id: impl Into<String>) -> PhoneResult<()> {
        let device_id = device_id.into();
        self.request(|reply| Command::SelectOutput { device_id, reply }).await
    }

    /// Play the test tone on the selected output
    pub async fn test_speaker(&self) -> PhoneResult<()> {
        self.request(Command::TestSpeaker).await
    }

    pub async fn refresh_devices(&self) -> PhoneResult<()> {
        self.request(Command::RefreshDevices).await
    }

    /// Ask for microphone access again, e.g. after the user changed permissions
    pub async fn retry_microphone(&self) -> PhoneResult<()> {
        self.request(Command::RetryMicrophone).await
    }

    /// Reconnect whatever leg is down, starting backoff from scratch
    pub async fn reconnect(&self) -> PhoneResult<()> {
        self.request(Command::Reconnect).await
    }

    /// Tear the session down; the task exits afterwards
    pub async fn shutdown(&self) -> PhoneResult<()> {
        self.request(Command::Shutdown).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every republished snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Stream of user-facing notices from now on
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Resolves once the session task has exited
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    async fn request<F>(&self, build: F) -> PhoneResult<()>
    where
        F: FnOnce(oneshot::Sender<PhoneResult<()>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| PhoneError::ChannelClosed)?;
        reply_rx.await.map_err(|_| PhoneError::ChannelClosed)?
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}
