//! Call control: wiring the call state machine to the SDK call object

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::actor::{LiveCall, SessionActor, SessionEvent};
use crate::call::{CallEffect, CallId, CallInput, CallQuality, CallState};
use crate::error::{PhoneError, PhoneResult};
use crate::registration::RegistrationState;
use crate::telephony::{CallHandle, CallObjectEvent, TelephonyCall};
use crate::timer::{TimerFired, TimerKind};

/// Shown when the SDK has no caller identity
const UNKNOWN_CALLER: &str = "Unknown caller";

const DURATION_TICK: Duration = Duration::from_secs(1);

impl SessionActor {
    pub(super) async fn on_incoming_call(&mut self, handle: CallHandle) {
        let call_id = Uuid::new_v4();
        let identity = handle.call.remote_identity();
        let remote_identity = if identity.trim().is_empty() {
            UNKNOWN_CALLER.to_string()
        } else {
            identity
        };

        match self.calls.apply(CallInput::Incoming {
            call_id,
            remote_identity: remote_identity.clone(),
        }) {
            Some(step) => {
                self.attach_call(call_id, handle);
                self.run_call_effects(step.effects).await;
            }
            None => {
                // no call waiting: the live call keeps the agent
                debug!(remote = %remote_identity, "Incoming call object dropped");
            }
        }
    }

    fn attach_call(&mut self, call_id: CallId, handle: CallHandle) {
        let CallHandle { call, mut events } = handle;
        let session_events = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if session_events.send(SessionEvent::Call { call_id, event }).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.live_call.replace(LiveCall { id: call_id, call, pump }) {
            debug!(call_id = %previous.id, "Previous call object released");
            previous.release();
        }
    }

    fn live_call_object(&self, call_id: CallId) -> Option<Arc<dyn TelephonyCall>> {
        self.live_call
            .as_ref()
            .filter(|live| live.id == call_id)
            .map(|live| live.call.clone())
    }

    /// Execute effects in order
    pub(super) async fn run_call_effects(&mut self, effects: Vec<CallEffect>) {
        for effect in effects {
            match effect {
                CallEffect::ArmAnswerTimeout { call_id, after } => {
                    self.timers.arm_once(TimerKind::AnswerTimeout, after, Some(call_id));
                }
                CallEffect::CancelAnswerTimeout => self.timers.cancel(TimerKind::AnswerTimeout),
                CallEffect::StartCallTimers { call_id } => {
                    self.timers.arm_repeating(TimerKind::DurationTick, DURATION_TICK, Some(call_id));
                    self.timers
                        .arm_repeating(TimerKind::QualityCheck, self.config.timing.quality_interval, Some(call_id));
                }
                CallEffect::StopCallTimers => {
                    self.timers.cancel(TimerKind::DurationTick);
                    self.timers.cancel(TimerKind::QualityCheck);
                }
                CallEffect::NotifyIncoming { remote_identity } => {
                    if self.notifier.permission_granted() {
                        self.notifier.notify_incoming(&remote_identity);
                    } else {
                        debug!("Notification permission not granted");
                    }
                }
                CallEffect::PublishStatus(status) => self.publish_status(status),
                CallEffect::RejectCallObject => {
                    if let Some(live) = &self.live_call {
                        if let Err(err) = live.call.reject().await {
                            self.report(&err);
                        }
                    }
                }
                CallEffect::ReleaseCall => {
                    if let Some(live) = self.live_call.take() {
                        live.release();
                    }
                    self.audio.set_muted(false);
                    self.audio.set_output_level(0.0);
                }
                CallEffect::ReRegisterDevice => self.reregister(),
                CallEffect::Notice(notice) => self.notify(notice),
            }
        }
    }

    async fn apply_call(&mut self, input: CallInput) {
        if let Some(step) = self.calls.apply(input) {
            if let Some(reason) = &step.ended {
                debug!(from = %step.from, reason = %reason, "Call ended");
            }
            self.run_call_effects(step.effects).await;
        }
    }

    pub(super) async fn on_call_object_event(&mut self, call_id: CallId, event: CallObjectEvent) {
        if self.calls.current_call_id() != Some(call_id) {
            debug!(call_id = %call_id, ?event, "Event from a finished call dropped");
            return;
        }
        let input = match event {
            CallObjectEvent::Accepted => CallInput::RemoteAccepted { call_id },
            CallObjectEvent::Disconnected => CallInput::Disconnected { call_id },
            CallObjectEvent::Cancelled => CallInput::Cancelled { call_id },
            CallObjectEvent::Error { message } => {
                warn!(call_id = %call_id, message = %message, "Call error");
                CallInput::Failed { call_id, message }
            }
            CallObjectEvent::Volume { output, .. } => {
                self.audio.set_output_level(output);
                return;
            }
            CallObjectEvent::Warning(name) => CallInput::Warning { call_id, name },
            CallObjectEvent::WarningCleared(name) => CallInput::WarningCleared { call_id, name },
        };
        self.apply_call(input).await;
    }

    pub(super) async fn on_call_timer(&mut self, fired: TimerFired) {
        let Some(call_id) = fired.tag else {
            return;
        };
        match fired.kind {
            TimerKind::AnswerTimeout => {
                // the call may have been answered while the fire was queued
                if self.calls.is_pending_incoming(call_id) {
                    info!(call_id = %call_id, "Incoming call not answered in time");
                    self.apply_call(CallInput::AnswerTimeout { call_id }).await;
                }
            }
            TimerKind::DurationTick => self.apply_call(CallInput::Tick { call_id }).await,
            TimerKind::QualityCheck => {
                let Some(call) = self.live_call_object(call_id) else {
                    return;
                };
                let Some(metrics) = call.quality_metrics().await else {
                    debug!(call_id = %call_id, "No quality metrics available");
                    return;
                };
                if let Some(quality) = CallQuality::from_metrics(&metrics) {
                    self.apply_call(CallInput::QualitySampled { call_id, quality }).await;
                }
            }
            _ => {}
        }
    }

    // ---- user actions ----

    fn ringing_call(&self, operation: &str) -> PhoneResult<(CallId, Arc<dyn TelephonyCall>)> {
        let call_id = self
            .calls
            .current_call_id()
            .filter(|id| self.calls.is_pending_incoming(*id))
            .ok_or_else(|| PhoneError::invalid_state(operation, self.calls.state()))?;
        let call = self.live_call_object(call_id).ok_or(PhoneError::NoActiveCall)?;
        Ok((call_id, call))
    }

    pub(super) async fn accept(&mut self) -> PhoneResult<()> {
        let (call_id, call) = self.ringing_call("accept")?;
        call.accept(&self.config.accept_constraints).await?;
        self.apply_call(CallInput::Accept { call_id }).await;
        Ok(())
    }

    pub(super) async fn reject(&mut self) -> PhoneResult<()> {
        let (call_id, call) = self.ringing_call("reject")?;
        call.reject().await?;
        self.apply_call(CallInput::Reject { call_id }).await;
        Ok(())
    }

    /// Hang up; a call still ringing is rejected instead
    pub(super) async fn end(&mut self) -> PhoneResult<()> {
        match self.calls.state() {
            CallState::Incoming => self.reject().await,
            CallState::Active => {
                let call_id = self.calls.current_call_id().ok_or(PhoneError::NoActiveCall)?;
                let call = self.live_call_object(call_id).ok_or(PhoneError::NoActiveCall)?;
                call.disconnect().await?;
                self.apply_call(CallInput::End { call_id }).await;
                Ok(())
            }
            CallState::None | CallState::Ended => Err(PhoneError::NoActiveCall),
        }
    }

    pub(super) async fn toggle_mute(&mut self) -> PhoneResult<()> {
        let session = self.calls.session().ok_or(PhoneError::NoActiveCall)?;
        let call_id = session.id;
        let muted = !session.muted;
        let call = self.live_call_object(call_id).ok_or(PhoneError::NoActiveCall)?;

        call.mute(muted).await?;
        self.apply_call(CallInput::MuteChanged { call_id, muted }).await;
        self.audio.set_muted(muted);
        Ok(())
    }

    pub(super) async fn dial(&mut self, to: &str) -> PhoneResult<()> {
        let to = to.trim();
        if to.is_empty() {
            return Err(PhoneError::InvalidConfiguration {
                field: "to".to_string(),
                reason: "a number or client identity is required".to_string(),
            });
        }
        if self.calls.state() != CallState::None {
            return Err(PhoneError::invalid_state("dial", self.calls.state()));
        }
        let device = match (self.registration.state(), self.registration.device()) {
            (RegistrationState::Registered, Some(device)) => device,
            (state, _) => return Err(PhoneError::invalid_state("dial", state)),
        };

        let handle = device.connect(to).await?;
        let call_id = Uuid::new_v4();
        match self.calls.apply(CallInput::Dialed {
            call_id,
            remote_identity: to.to_string(),
        }) {
            Some(step) => {
                self.attach_call(call_id, handle);
                self.run_call_effects(step.effects).await;
                Ok(())
            }
            None => {
                let _ = handle.call.disconnect().await;
                Err(PhoneError::invalid_state("dial", self.calls.state()))
            }
        }
    }
}
