//! Signalling channel state machine
//!
//! ```text
//!                 ConnectRequested              Opened
//!  DISCONNECTED ───────────────────▶ CONNECTING ───────▶ CONNECTED
//!       ▲  ▲                             │                  │
//!       │  │          ConnectFailed      ▼                  │ Closed(code)
//!       │  └───────────────────────── ERROR                 │
//!       │        (reconnect timer)                          │
//!       └───────────────────────────────────────────────────┘
//! ```
//!
//! [`SignallingChannel::apply`] is the only place the state changes. It
//! returns the actions the owner must carry out (open a socket, announce the
//! agent, arm or cancel timers) or `None` when the event does not apply to the
//! current state.
//!
//! A close with code 1000, or any close the client initiated, is deliberate
//! and never reconnects. Everything else (1006, failed or timed out connects)
//! increments `reconnect_attempts` and schedules a reconnect after
//! `backoff.schedule_retry(reconnect_attempts)`.

use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::OutboundMessage;
use super::transport::{OutboundFrame, CLOSE_NORMAL};
use crate::backoff::Backoff;
use crate::error::{PhoneError, PhoneResult};

/// Connection state of the signalling leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignallingState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for SignallingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignallingState::Disconnected => write!(f, "disconnected"),
            SignallingState::Connecting => write!(f, "connecting"),
            SignallingState::Connected => write!(f, "connected"),
            SignallingState::Error => write!(f, "error"),
        }
    }
}

/// Input to the signalling state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Open a connection (boot, reconnect timer, manual reconnect)
    ConnectRequested,
    Opened,
    /// Connect failed or did not open within the connect timeout
    ConnectFailed { reason: String },
    /// The remote end or the network closed the link
    Closed { code: u16 },
    /// Any inbound frame, parseable or not
    MessageReceived,
    /// Deliberate client-side teardown
    LocalClose,
}

/// Work the owner of the channel must perform after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    Connect,
    SendRegister,
    StartHeartbeat,
    StopHeartbeat,
    ScheduleReconnect { delay: Duration, attempt: u32 },
    CancelReconnect,
}

/// Result of an applied event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStep {
    pub from: SignallingState,
    pub to: SignallingState,
    pub actions: Vec<ChannelAction>,
}

#[derive(Debug)]
struct ActiveLink {
    id: u64,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

/// Signalling connection owned by the session manager
#[derive(Debug)]
pub struct SignallingChannel {
    state: SignallingState,
    backoff: Backoff,
    stale_after: Duration,
    reconnect_attempts: u32,
    last_heartbeat_at: Option<Instant>,
    link: Option<ActiveLink>,
    next_link_id: u64,
    connect_attempt: u64,
}

impl SignallingChannel {
    pub fn new(backoff: Backoff, stale_after: Duration) -> Self {
        Self {
            state: SignallingState::Disconnected,
            backoff,
            stale_after,
            reconnect_attempts: 0,
            last_heartbeat_at: None,
            link: None,
            next_link_id: 0,
            connect_attempt: 0,
        }
    }

    pub fn state(&self) -> SignallingState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.last_heartbeat_at
    }

    /// Transition function
    pub fn apply(&mut self, event: ChannelEvent, now: Instant) -> Option<ChannelStep> {
        use ChannelAction as A;
        use SignallingState as S;

        let from = self.state;
        let (to, actions) = match (from, &event) {
            (S::Disconnected | S::Error, ChannelEvent::ConnectRequested) => {
                (S::Connecting, vec![A::CancelReconnect, A::Connect])
            }

            (S::Connecting, ChannelEvent::Opened) => {
                self.reconnect_attempts = 0;
                self.last_heartbeat_at = Some(now);
                (S::Connected, vec![A::SendRegister, A::StartHeartbeat])
            }

            (S::Connecting, ChannelEvent::ConnectFailed { reason }) => {
                let action = self.next_reconnect();
                warn!(
                    reason = %reason,
                    attempt = self.reconnect_attempts,
                    "Signalling connect failed"
                );
                (S::Error, vec![action])
            }

            (S::Connected, ChannelEvent::Closed { code }) => {
                self.link = None;
                if *code == CLOSE_NORMAL {
                    info!(code, "Signalling closed normally");
                    (S::Disconnected, vec![A::StopHeartbeat])
                } else {
                    let action = self.next_reconnect();
                    warn!(code, attempt = self.reconnect_attempts, "Signalling closed abnormally");
                    (S::Disconnected, vec![A::StopHeartbeat, action])
                }
            }

            (S::Connected, ChannelEvent::MessageReceived) => {
                self.last_heartbeat_at = Some(now);
                (S::Connected, Vec::new())
            }

            (S::Connected, ChannelEvent::LocalClose) => {
                (S::Disconnected, vec![A::StopHeartbeat, A::CancelReconnect])
            }

            (S::Connecting | S::Disconnected | S::Error, ChannelEvent::LocalClose) => {
                // orphan any in-flight connect
                self.connect_attempt += 1;
                (S::Disconnected, vec![A::CancelReconnect])
            }

            _ => {
                debug!(state = %from, ?event, "Signalling event ignored");
                return None;
            }
        };

        if from != to {
            debug!(from = %from, to = %to, "Signalling state changed");
        }
        self.state = to;
        Some(ChannelStep { from, to, actions })
    }

    fn next_reconnect(&mut self) -> ChannelAction {
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        ChannelAction::ScheduleReconnect {
            delay: self.backoff.schedule_retry(self.reconnect_attempts),
            attempt: self.reconnect_attempts,
        }
    }

    /// Tag a new connect attempt; results carrying an older tag are stale
    pub fn begin_attempt(&mut self) -> u64 {
        self.connect_attempt += 1;
        self.connect_attempt
    }

    pub fn is_current_attempt(&self, attempt: u64) -> bool {
        self.state == SignallingState::Connecting && self.connect_attempt == attempt
    }

    /// Adopt an open link; inbound events must be tagged with the returned id
    pub fn attach(&mut self, outbound: mpsc::UnboundedSender<OutboundFrame>) -> u64 {
        self.next_link_id += 1;
        let id = self.next_link_id;
        self.link = Some(ActiveLink { id, outbound });
        id
    }

    pub fn is_current_link(&self, link_id: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.id == link_id)
    }

    /// Serialize and queue a message on the open link
    pub fn send(&self, message: &OutboundMessage) -> PhoneResult<()> {
        let link = match (&self.link, self.state) {
            (Some(link), SignallingState::Connected) => link,
            _ => return Err(PhoneError::invalid_state(format!("send {}", message.kind()), self.state)),
        };
        let json = message.to_json()?;
        link.outbound
            .send(OutboundFrame::Text(json))
            .map_err(|_| PhoneError::network("signalling link closed"))?;
        debug!(kind = message.kind(), "Signalling message sent");
        Ok(())
    }

    /// Close with code 1000 and mark the close as deliberate
    pub fn close_locally(&mut self, now: Instant) -> Option<ChannelStep> {
        if let Some(link) = self.link.take() {
            let _ = link.outbound.send(OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "client closing".to_string(),
            });
        }
        self.apply(ChannelEvent::LocalClose, now)
    }

    /// Forget past failures so the next reconnect starts from the base delay
    pub fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// Age of the last inbound traffic
    pub fn heartbeat_age(&self, now: Instant) -> Option<Duration> {
        self.last_heartbeat_at.map(|at| now.saturating_duration_since(at))
    }

    /// Connected and heard from within the staleness threshold
    pub fn is_healthy(&self, now: Instant) -> bool {
        self.state == SignallingState::Connected
            && self.heartbeat_age(now).is_some_and(|age| age <= self.stale_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn channel() -> SignallingChannel {
        SignallingChannel::new(Backoff::signalling(), Duration::from_secs(90))
    }

    fn connected(now: Instant) -> SignallingChannel {
        let mut channel = channel();
        channel.apply(ChannelEvent::ConnectRequested, now).unwrap();
        channel.apply(ChannelEvent::Opened, now).unwrap();
        channel
    }

    #[test]
    fn test_open_announces_and_starts_heartbeat() {
        let now = Instant::now();
        let mut channel = channel();
        let step = channel.apply(ChannelEvent::ConnectRequested, now).unwrap();
        assert_eq!(step.to, SignallingState::Connecting);
        assert!(step.actions.contains(&ChannelAction::Connect));

        let step = channel.apply(ChannelEvent::Opened, now).unwrap();
        assert_eq!(step.to, SignallingState::Connected);
        assert_eq!(step.actions, vec![ChannelAction::SendRegister, ChannelAction::StartHeartbeat]);
        assert_eq!(channel.last_heartbeat_at(), Some(now));
    }

    #[test]
    #[traced_test]
    fn test_abnormal_close_is_logged_with_attempt() {
        let now = Instant::now();
        let mut channel = connected(now);
        channel.apply(ChannelEvent::Closed { code: 1006 }, now).unwrap();
        assert!(logs_contain("Signalling closed abnormally"));
        assert!(logs_contain("attempt=1"));
    }

    #[test]
    fn test_abnormal_close_schedules_reconnect() {
        let now = Instant::now();
        let mut channel = connected(now);
        assert_eq!(channel.reconnect_attempts(), 0);

        let step = channel.apply(ChannelEvent::Closed { code: 1006 }, now).unwrap();
        assert_eq!(step.to, SignallingState::Disconnected);
        assert_eq!(channel.reconnect_attempts(), 1);
        assert!(step.actions.contains(&ChannelAction::ScheduleReconnect {
            delay: Duration::from_secs(6),
            attempt: 1,
        }));
    }

    #[test]
    fn test_normal_close_does_not_reconnect() {
        let now = Instant::now();
        let mut channel = connected(now);
        let step = channel.apply(ChannelEvent::Closed { code: 1000 }, now).unwrap();
        assert_eq!(step.actions, vec![ChannelAction::StopHeartbeat]);
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[test]
    fn test_local_close_cancels_reconnect() {
        let now = Instant::now();
        let mut channel = connected(now);
        let step = channel.close_locally(now).unwrap();
        assert_eq!(step.to, SignallingState::Disconnected);
        assert!(step.actions.contains(&ChannelAction::CancelReconnect));
        assert!(!step
            .actions
            .iter()
            .any(|a| matches!(a, ChannelAction::ScheduleReconnect { .. })));
    }

    #[test]
    fn test_reconnect_delays_grow_then_reset() {
        let now = Instant::now();
        let mut channel = channel();
        let mut delays = Vec::new();
        for _ in 0..8 {
            channel.apply(ChannelEvent::ConnectRequested, now).unwrap();
            let step = channel
                .apply(ChannelEvent::ConnectFailed { reason: "refused".into() }, now)
                .unwrap();
            for action in step.actions {
                if let ChannelAction::ScheduleReconnect { delay, .. } = action {
                    delays.push(delay);
                }
            }
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays.last(), Some(&Duration::from_secs(60)));

        channel.apply(ChannelEvent::ConnectRequested, now).unwrap();
        channel.apply(ChannelEvent::Opened, now).unwrap();
        assert_eq!(channel.reconnect_attempts(), 0);

        let step = channel.apply(ChannelEvent::Closed { code: 1006 }, now).unwrap();
        assert!(step.actions.contains(&ChannelAction::ScheduleReconnect {
            delay: Duration::from_secs(6),
            attempt: 1,
        }));
    }

    #[test]
    fn test_stray_events_ignored() {
        let now = Instant::now();
        let mut channel = connected(now);
        assert!(channel.apply(ChannelEvent::ConnectRequested, now).is_none());
        assert!(channel.apply(ChannelEvent::Opened, now).is_none());

        let mut idle = SignallingChannel::new(Backoff::signalling(), Duration::from_secs(90));
        assert!(idle.apply(ChannelEvent::MessageReceived, now).is_none());
        assert!(idle.apply(ChannelEvent::Closed { code: 1006 }, now).is_none());
    }

    #[test]
    fn test_staleness_independent_of_state() {
        let start = Instant::now();
        let mut channel = connected(start);
        assert!(channel.is_healthy(start + Duration::from_secs(90)));
        assert!(!channel.is_healthy(start + Duration::from_secs(91)));
        assert_eq!(channel.state(), SignallingState::Connected);

        channel.apply(ChannelEvent::MessageReceived, start + Duration::from_secs(91));
        assert!(channel.is_healthy(start + Duration::from_secs(100)));
    }

    #[test]
    fn test_send_requires_open_link() {
        let now = Instant::now();
        let mut channel = connected(now);
        assert!(channel.send(&OutboundMessage::Ping).is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = channel.attach(tx);
        assert!(channel.is_current_link(id));
        channel.send(&OutboundMessage::Ping).unwrap();
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Text(r#"{"type":"ping"}"#.into()));
    }

    #[test]
    fn test_attempt_tags() {
        let now = Instant::now();
        let mut channel = channel();
        channel.apply(ChannelEvent::ConnectRequested, now).unwrap();
        let first = channel.begin_attempt();
        assert!(channel.is_current_attempt(first));

        channel.close_locally(now);
        assert!(!channel.is_current_attempt(first));
    }
}
