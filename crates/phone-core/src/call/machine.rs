//! Call session state machine
//!
//! ```text
//!            Incoming                Accept / RemoteAccepted
//!   NONE ─────────────▶ INCOMING ───────────────────────────▶ ACTIVE
//!    ▲  │                  │                                    │
//!    │  │ Dialed           │ Reject / Cancelled / AnswerTimeout │ End / Disconnected
//!    │  └──────────────────┼───────────────▶ ACTIVE             │
//!    │                     ▼                                    ▼
//!    └──────────────────── ENDED ◀──────────────────────────────┘
//!                    (Failed from any live state)
//! ```
//!
//! [`CallSessionMachine::apply`] is the single transition function. It never
//! talks to the SDK; it returns the [`CallEffect`]s the session manager must
//! carry out, in order. Inputs that do not fit the current state (a second
//! incoming call, an accept while already active, events for a call that is no
//! longer tracked) return `None` and change nothing.
//!
//! Every path out of a live call goes through
//! [`CallSessionMachine::reset_call_session`], so the reset invariant
//! (duration back to 0, session cleared, call timers cancelled) is defined
//! once.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::session::{CallDirection, CallId, CallQuality, CallSession, CallSnapshot, CallState, EndReason};
use crate::events::SessionNotice;
use crate::signalling::AgentStatus;

/// Input to the call state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    /// The SDK delivered an incoming call
    Incoming { call_id: CallId, remote_identity: String },
    /// The agent placed an outbound call
    Dialed { call_id: CallId, remote_identity: String },
    /// Local accept succeeded on the call object
    Accept { call_id: CallId },
    /// The SDK reported the call as accepted
    RemoteAccepted { call_id: CallId },
    /// Local reject succeeded on the call object
    Reject { call_id: CallId },
    /// The caller hung up before answer
    Cancelled { call_id: CallId },
    /// The answer timer fired for this call
    AnswerTimeout { call_id: CallId },
    /// Local hangup succeeded on the call object
    End { call_id: CallId },
    /// The SDK reported the call as disconnected
    Disconnected { call_id: CallId },
    Failed { call_id: CallId, message: String },
    /// One second of the duration timer
    Tick { call_id: CallId },
    QualitySampled { call_id: CallId, quality: CallQuality },
    Warning { call_id: CallId, name: String },
    WarningCleared { call_id: CallId, name: String },
    MuteChanged { call_id: CallId, muted: bool },
}

impl CallInput {
    pub fn call_id(&self) -> CallId {
        match self {
            CallInput::Incoming { call_id, .. }
            | CallInput::Dialed { call_id, .. }
            | CallInput::Accept { call_id }
            | CallInput::RemoteAccepted { call_id }
            | CallInput::Reject { call_id }
            | CallInput::Cancelled { call_id }
            | CallInput::AnswerTimeout { call_id }
            | CallInput::End { call_id }
            | CallInput::Disconnected { call_id }
            | CallInput::Failed { call_id, .. }
            | CallInput::Tick { call_id }
            | CallInput::QualitySampled { call_id, .. }
            | CallInput::Warning { call_id, .. }
            | CallInput::WarningCleared { call_id, .. }
            | CallInput::MuteChanged { call_id, .. } => *call_id,
        }
    }
}

/// Work the session manager must perform after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum CallEffect {
    ArmAnswerTimeout { call_id: CallId, after: Duration },
    CancelAnswerTimeout,
    /// Start the duration tick and quality sampling for this call
    StartCallTimers { call_id: CallId },
    StopCallTimers,
    /// Raise a desktop notification if permitted
    NotifyIncoming { remote_identity: String },
    PublishStatus(AgentStatus),
    /// Reject the call object on the SDK (answer timeout)
    RejectCallObject,
    /// Forget the call object and stop listening to it
    ReleaseCall,
    /// A call error may mean the device is stale
    ReRegisterDevice,
    Notice(SessionNotice),
}

/// Result of an applied input
#[derive(Debug, Clone, PartialEq)]
pub struct CallStep {
    pub from: CallState,
    /// `Ended` when the call finished; the machine itself then rests in `None`
    pub to: CallState,
    pub ended: Option<EndReason>,
    pub effects: Vec<CallEffect>,
}

/// Owner of the single live call
#[derive(Debug)]
pub struct CallSessionMachine {
    session: Option<CallSession>,
    answer_timeout: Duration,
}

impl CallSessionMachine {
    pub fn new(answer_timeout: Duration) -> Self {
        Self {
            session: None,
            answer_timeout,
        }
    }

    pub fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::None, |s| s.state)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn current_call_id(&self) -> Option<CallId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Whether `call_id` is the call currently ringing
    pub fn is_pending_incoming(&self, call_id: CallId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.id == call_id && s.state == CallState::Incoming)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.session.as_ref().map_or_else(CallSnapshot::idle, CallSnapshot::from)
    }

    /// Transition function
    pub fn apply(&mut self, input: CallInput) -> Option<CallStep> {
        let from = self.state();

        if let CallInput::Incoming { call_id, remote_identity } = &input {
            return self.on_incoming(from, *call_id, remote_identity);
        }
        if let CallInput::Dialed { call_id, remote_identity } = &input {
            return self.on_dialed(from, *call_id, remote_identity);
        }

        let Some(session) = self.session.as_mut() else {
            debug!(?input, "Call input ignored, no live call");
            return None;
        };
        if session.id != input.call_id() {
            debug!(current = %session.id, ?input, "Call input for another call ignored");
            return None;
        }

        use CallInput as I;
        use CallState as S;

        let step = match (from, input) {
            (S::Incoming, I::Accept { .. } | I::RemoteAccepted { .. }) => {
                session.state = S::Active;
                session.connected = true;
                session.duration_seconds = 0;
                info!(call_id = %session.id, remote = %session.remote_identity, "Call answered");
                let call_id = session.id;
                self.stay(
                    from,
                    vec![
                        CallEffect::CancelAnswerTimeout,
                        CallEffect::StartCallTimers { call_id },
                        CallEffect::PublishStatus(AgentStatus::Busy),
                    ],
                )
            }

            (S::Active, I::RemoteAccepted { .. })
                if session.direction == CallDirection::Outbound && !session.connected =>
            {
                session.connected = true;
                info!(call_id = %session.id, "Outbound call connected");
                self.stay(from, Vec::new())
            }

            (S::Incoming, I::Reject { .. }) => self.reset_call_session(EndReason::Rejected),

            (S::Incoming, I::Cancelled { .. } | I::Disconnected { .. }) => {
                let remote_identity = session.remote_identity.clone();
                let mut step = self.reset_call_session(EndReason::Cancelled);
                step.effects
                    .push(CallEffect::Notice(SessionNotice::CallCancelled { remote_identity }));
                step
            }

            (S::Incoming, I::AnswerTimeout { .. }) => {
                let remote_identity = session.remote_identity.clone();
                warn!(call_id = %session.id, remote = %remote_identity, "Answer timeout, rejecting call");
                let mut step = self.reset_call_session(EndReason::AnswerTimeout);
                // the call object must still be held when it is rejected
                step.effects.insert(0, CallEffect::RejectCallObject);
                step.effects
                    .push(CallEffect::Notice(SessionNotice::MissedCall { remote_identity }));
                step
            }

            (S::Active, I::End { .. }) => self.reset_call_session(EndReason::LocalHangup),

            (S::Active, I::Disconnected { .. }) => self.reset_call_session(EndReason::RemoteHangup),

            (S::Incoming | S::Active, I::Failed { message, .. }) => {
                warn!(call_id = %session.id, error = %message, "Call failed");
                let mut step = self.reset_call_session(EndReason::Failed {
                    message: message.clone(),
                });
                step.effects.push(CallEffect::Notice(SessionNotice::CallFailed { message }));
                step.effects.push(CallEffect::ReRegisterDevice);
                step
            }

            (S::Active, I::Tick { .. }) => {
                session.duration_seconds += 1;
                self.stay(from, Vec::new())
            }

            (S::Active, I::QualitySampled { quality, .. }) => {
                if session.warnings.is_empty() {
                    if session.quality == quality {
                        return None;
                    }
                    session.quality = quality;
                } else {
                    // restored once the warnings clear
                    session.quality_before_warnings = Some(quality);
                }
                self.stay(from, Vec::new())
            }

            (S::Incoming | S::Active, I::Warning { name, .. }) => {
                if session.warnings.contains(&name) {
                    return None;
                }
                if session.warnings.is_empty() {
                    session.quality_before_warnings = Some(session.quality);
                }
                session.warnings.insert(name.clone());
                session.quality = CallQuality::Poor;
                warn!(call_id = %session.id, warning = %name, "Call quality warning");
                self.stay(
                    from,
                    vec![CallEffect::Notice(SessionNotice::QualityDegraded { warning: name })],
                )
            }

            (S::Incoming | S::Active, I::WarningCleared { name, .. }) => {
                if !session.warnings.remove(&name) {
                    return None;
                }
                if !session.warnings.is_empty() {
                    return Some(self.stay(from, Vec::new()));
                }
                let quality = session.quality_before_warnings.take().unwrap_or(session.quality);
                session.quality = quality;
                info!(call_id = %session.id, warning = %name, %quality, "Call quality warnings cleared");
                self.stay(
                    from,
                    vec![CallEffect::Notice(SessionNotice::QualityRestored { quality })],
                )
            }

            (S::Incoming | S::Active, I::MuteChanged { muted, .. }) => {
                if session.muted == muted {
                    return None;
                }
                session.muted = muted;
                self.stay(from, Vec::new())
            }

            (state, input) => {
                debug!(%state, ?input, "Call input ignored");
                return None;
            }
        };
        Some(step)
    }

    fn on_incoming(&mut self, from: CallState, call_id: CallId, remote_identity: &str) -> Option<CallStep> {
        if from != CallState::None {
            warn!(%call_id, remote = %remote_identity, state = %from, "Incoming call while busy ignored");
            return None;
        }
        if remote_identity.trim().is_empty() {
            warn!(%call_id, "Incoming call without caller identity ignored");
            return None;
        }

        info!(%call_id, remote = %remote_identity, "Incoming call");
        self.session = Some(CallSession::new(
            call_id,
            remote_identity.to_string(),
            CallDirection::Inbound,
            CallState::Incoming,
        ));
        Some(CallStep {
            from,
            to: CallState::Incoming,
            ended: None,
            effects: vec![
                CallEffect::ArmAnswerTimeout {
                    call_id,
                    after: self.answer_timeout,
                },
                CallEffect::NotifyIncoming {
                    remote_identity: remote_identity.to_string(),
                },
                CallEffect::Notice(SessionNotice::IncomingCall {
                    call_id,
                    remote_identity: remote_identity.to_string(),
                }),
            ],
        })
    }

    fn on_dialed(&mut self, from: CallState, call_id: CallId, remote_identity: &str) -> Option<CallStep> {
        if from != CallState::None || remote_identity.trim().is_empty() {
            debug!(%call_id, state = %from, "Dial ignored");
            return None;
        }

        info!(%call_id, to = %remote_identity, "Outbound call placed");
        self.session = Some(CallSession::new(
            call_id,
            remote_identity.to_string(),
            CallDirection::Outbound,
            CallState::Active,
        ));
        Some(CallStep {
            from,
            to: CallState::Active,
            ended: None,
            effects: vec![
                CallEffect::StartCallTimers { call_id },
                CallEffect::PublishStatus(AgentStatus::Busy),
            ],
        })
    }

    fn stay(&self, from: CallState, effects: Vec<CallEffect>) -> CallStep {
        CallStep {
            from,
            to: self.state(),
            ended: None,
            effects,
        }
    }

    /// Drop the live call and cancel everything attached to it
    ///
    /// The only way a call leaves the machine. Returns a step ending in
    /// `Ended`; the agent is reported free again if the call had been active.
    pub fn reset_call_session(&mut self, reason: EndReason) -> CallStep {
        let Some(session) = self.session.take() else {
            return CallStep {
                from: CallState::None,
                to: CallState::None,
                ended: None,
                effects: Vec::new(),
            };
        };

        let mut effects = vec![
            CallEffect::CancelAnswerTimeout,
            CallEffect::StopCallTimers,
            CallEffect::ReleaseCall,
        ];
        if session.state == CallState::Active {
            effects.push(CallEffect::PublishStatus(AgentStatus::Free));
            effects.push(CallEffect::Notice(SessionNotice::CallEnded {
                call_id: session.id,
                duration_seconds: session.duration_seconds,
                reason: reason.clone(),
            }));
        }

        info!(
            call_id = %session.id,
            reason = %reason,
            duration_seconds = session.duration_seconds,
            "Call session reset"
        );
        CallStep {
            from: session.state,
            to: CallState::Ended,
            ended: Some(reason),
            effects,
        }
    }
}
