//! Session timers
//!
//! Every timer the session manager uses is keyed by a [`TimerKind`] and lives
//! in one [`Timers`] table. Arming a kind replaces (and aborts) the previous
//! timer of that kind. Fires are delivered as [`TimerFired`] messages on the
//! session's event channel and carry the generation they were armed with, so a
//! fire that raced with a cancel or re-arm is recognized and dropped by
//! [`Timers::accept`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;
use uuid::Uuid;

/// Every timer the session manager arms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Auto-reject of a ringing call
    AnswerTimeout,
    /// One-second duration counter of the active call
    DurationTick,
    /// Periodic call quality sample
    QualityCheck,
    /// Signalling ping
    Heartbeat,
    /// Connection health re-evaluation
    HealthCheck,
    SignallingReconnect,
    TokenRefresh,
    TokenRefreshRetry,
    RegistrationRetry,
    /// Re-register after a spontaneous unregistration
    ReRegister,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A timer went off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
    /// Call the timer was armed for, if any
    pub tag: Option<Uuid>,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

/// Table of armed timers
#[derive(Debug)]
pub struct Timers {
    fired: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TimerKind, ArmedTimer>,
    next_generation: u64,
}

impl Timers {
    pub fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            fired,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Fire once after `after`
    pub fn arm_once(&mut self, kind: TimerKind, after: Duration, tag: Option<Uuid>) {
        let generation = self.next_generation();
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = fired.send(TimerFired { kind, generation, tag });
        });
        trace!(%kind, after_ms = after.as_millis() as u64, generation, "Timer armed");
        self.install(kind, generation, false, handle);
    }

    /// Fire every `every`, first after one full period
    pub fn arm_repeating(&mut self, kind: TimerKind, every: Duration, tag: Option<Uuid>) {
        let generation = self.next_generation();
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                if fired.send(TimerFired { kind, generation, tag }).is_err() {
                    break;
                }
            }
        });
        trace!(%kind, every_ms = every.as_millis() as u64, generation, "Repeating timer armed");
        self.install(kind, generation, true, handle);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.armed.remove(&kind) {
            trace!(%kind, generation = timer.generation, "Timer cancelled");
            timer.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Whether a fire is still current; one-shot timers are disarmed by it
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        let current = self
            .armed
            .get(&fired.kind)
            .is_some_and(|t| t.generation == fired.generation);
        if !current {
            trace!(kind = %fired.kind, generation = fired.generation, "Stale timer fire dropped");
            return false;
        }
        if self.armed.get(&fired.kind).is_some_and(|t| !t.repeating) {
            self.armed.remove(&fired.kind);
        }
        true
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn install(&mut self, kind: TimerKind, generation: u64, repeating: bool, handle: JoinHandle<()>) {
        if let Some(previous) = self.armed.insert(
            kind,
            ArmedTimer {
                generation,
                repeating,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
