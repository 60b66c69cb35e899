//! Token refresh, device registration and signalling legs of the session

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::actor::{SessionActor, SessionEvent};
use crate::call::EndReason;
use crate::credential::{Credential, RefreshPlan, RefreshTrigger};
use crate::error::{PhoneError, PhoneResult};
use crate::events::SessionNotice;
use crate::registration::{RegistrationAction, RegistrationEvent, RegistrationState};
use crate::signalling::{
    AgentStatus, ChannelAction, ChannelEvent, InboundMessage, LinkEvent, OutboundFrame, OutboundMessage,
    SignallingLink, SignallingState, CLOSE_NORMAL,
};
use crate::telephony::DeviceEvent;
use crate::timer::TimerKind;

impl SessionActor {
    // ---- access token ----

    pub(super) fn fetch_token(&self, trigger: RefreshTrigger) {
        let tokens = self.tokens.clone();
        let identity = self.config.identity.clone();
        debug!(?trigger, identity = %identity, "Fetching access token");
        self.spawn_operation(
            async move { tokens.fetch_token(&identity).await },
            move |result| SessionEvent::TokenFetched { trigger, result },
        );
    }

    pub(super) async fn on_token(&mut self, trigger: RefreshTrigger, result: PhoneResult<Credential>) {
        match result {
            Ok(credential) => {
                let token = credential.token().to_string();
                let plan = self.refresher.on_fetched(trigger, credential);
                self.apply_refresh_plan(plan);

                match trigger {
                    RefreshTrigger::Initial | RefreshTrigger::RegistrationRetry => {
                        self.initialize_device(&token).await;
                        if !self.signalling_started {
                            self.connect_signalling();
                        }
                    }
                    RefreshTrigger::Scheduled | RefreshTrigger::ScheduledRetry | RefreshTrigger::TokenWillExpire => {
                        match self.registration.update_token(&token).await {
                            Ok(()) => debug!(?trigger, "Device token updated"),
                            Err(err) => self.report(&err),
                        }
                    }
                }

                if self.register_pending && self.channel.state() == SignallingState::Connected {
                    self.send_register();
                }
            }
            Err(err) => {
                let plan = self.refresher.on_failed(trigger, &err);
                self.apply_refresh_plan(plan);

                match trigger {
                    RefreshTrigger::Initial | RefreshTrigger::RegistrationRetry if err.is_auth_error() => {
                        // only a fresh login helps; wait for a manual reconnect
                        warn!(error = %err, "Access token refused, re-authentication required");
                        self.last_error = Some(format!("Sign in again to receive calls: {}", err));
                        self.report(&err);
                    }
                    RefreshTrigger::Initial | RefreshTrigger::RegistrationRetry => {
                        self.report(&err);
                        if let Some(step) = self.registration.apply(RegistrationEvent::TokenFetchFailed {
                            reason: err.to_string(),
                        }) {
                            self.run_registration_actions(step.actions);
                        }
                    }
                    RefreshTrigger::ScheduledRetry => self.notify(SessionNotice::TokenRefreshFailed {
                        message: err.to_string(),
                    }),
                    RefreshTrigger::Scheduled if !err.is_recoverable() => {
                        self.notify(SessionNotice::TokenRefreshFailed {
                            message: err.to_string(),
                        })
                    }
                    RefreshTrigger::Scheduled | RefreshTrigger::TokenWillExpire => {}
                }
            }
        }
    }

    fn apply_refresh_plan(&mut self, plan: RefreshPlan) {
        match plan {
            RefreshPlan::Rearm(after) => {
                self.timers.cancel(TimerKind::TokenRefreshRetry);
                self.timers.arm_once(TimerKind::TokenRefresh, after, None);
            }
            RefreshPlan::RetryIn(after) => self.timers.arm_once(TimerKind::TokenRefreshRetry, after, None),
            RefreshPlan::Nothing => {
                let cycle_running =
                    self.timers.is_armed(TimerKind::TokenRefresh) || self.timers.is_armed(TimerKind::TokenRefreshRetry);
                if !cycle_running && self.refresher.current().is_some() {
                    self.timers
                        .arm_once(TimerKind::TokenRefresh, self.config.timing.token_refresh_interval, None);
                }
            }
        }
    }

    // ---- telephony device ----

    async fn initialize_device(&mut self, token: &str) {
        if self.calls.current_call_id().is_some() {
            warn!("Replacing the telephony device drops the live call");
            let step = self.calls.reset_call_session(EndReason::Failed {
                message: "phone connection was reset".to_string(),
            });
            self.run_call_effects(step.effects).await;
        }

        let events = self.events.clone();
        let forward = move |generation: u64, event: DeviceEvent| events.send(SessionEvent::Device { generation, event }).is_ok();
        match self.registration.initialize(token, forward).await {
            Ok(step) => self.run_registration_actions(step.actions),
            Err(err) => {
                self.report(&err);
                if let Some(step) = self.registration.apply(RegistrationEvent::RegisterFailed {
                    reason: err.to_string(),
                }) {
                    self.run_registration_actions(step.actions);
                }
            }
        }
    }

    pub(super) async fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Registered => self.apply_registration(RegistrationEvent::Registered),
            DeviceEvent::Unregistered => self.apply_registration(RegistrationEvent::Unregistered),
            DeviceEvent::Error { message } => {
                self.report(&PhoneError::device(message.clone()));
                self.apply_registration(RegistrationEvent::DeviceError { reason: message });
            }
            DeviceEvent::Incoming(handle) => self.on_incoming_call(handle).await,
            DeviceEvent::TokenWillExpire => {
                info!("Device token about to expire, refreshing");
                self.fetch_token(RefreshTrigger::TokenWillExpire);
            }
            DeviceEvent::AudioDevicesChanged => {
                if let Err(err) = self.audio.refresh_device_list().await {
                    self.report(&err);
                }
            }
        }
    }

    pub(super) fn on_register_result(&mut self, result: PhoneResult<()>) {
        match result {
            Ok(()) => {
                info!(generation = self.registration.generation(), "Device registered");
                self.apply_registration(RegistrationEvent::Registered);
            }
            Err(err) => {
                self.report(&err);
                self.apply_registration(RegistrationEvent::RegisterFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    pub(super) fn reregister(&mut self) {
        self.apply_registration(RegistrationEvent::ReRegister);
    }

    fn apply_registration(&mut self, event: RegistrationEvent) {
        if let Some(step) = self.registration.apply(event) {
            self.run_registration_actions(step.actions);
        }
    }

    fn run_registration_actions(&mut self, actions: Vec<RegistrationAction>) {
        for action in actions {
            match action {
                RegistrationAction::Register => self.start_register(),
                RegistrationAction::RetryWithFreshToken { delay, attempt } => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Registration retry scheduled");
                    self.timers.arm_once(TimerKind::RegistrationRetry, delay, None);
                }
                RegistrationAction::ReRegisterAfter(delay) => {
                    self.timers.arm_once(TimerKind::ReRegister, delay, None);
                }
                RegistrationAction::CancelRetries => {
                    self.timers.cancel(TimerKind::RegistrationRetry);
                    self.timers.cancel(TimerKind::ReRegister);
                }
            }
        }
    }

    fn start_register(&self) {
        let Some(device) = self.registration.device() else {
            debug!("Register skipped, no device");
            return;
        };
        let generation = self.registration.generation();
        self.spawn_operation(
            async move { device.register().await },
            move |result| SessionEvent::RegisterResult { generation, result },
        );
    }

    // ---- signalling ----

    pub(super) fn connect_signalling(&mut self) {
        self.signalling_started = true;
        if let Some(step) = self.channel.apply(ChannelEvent::ConnectRequested, Instant::now()) {
            self.run_channel_actions(step.actions);
        }
    }

    pub(super) fn run_channel_actions(&mut self, actions: Vec<ChannelAction>) {
        for action in actions {
            match action {
                ChannelAction::Connect => self.start_connect(),
                ChannelAction::SendRegister => self.send_register(),
                ChannelAction::StartHeartbeat => {
                    self.timers
                        .arm_repeating(TimerKind::Heartbeat, self.config.timing.heartbeat_interval, None);
                }
                ChannelAction::StopHeartbeat => self.timers.cancel(TimerKind::Heartbeat),
                ChannelAction::ScheduleReconnect { delay, attempt } => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Signalling reconnect scheduled");
                    self.timers.arm_once(TimerKind::SignallingReconnect, delay, None);
                }
                ChannelAction::CancelReconnect => self.timers.cancel(TimerKind::SignallingReconnect),
            }
        }
    }

    fn start_connect(&mut self) {
        let attempt = self.channel.begin_attempt();
        let transport = self.transport.clone();
        let url = self.config.signalling_url.clone();
        let deadline = self.config.timing.connect_timeout;
        debug!(attempt, url = %url, "Opening signalling connection");
        self.spawn_operation(
            async move {
                match tokio::time::timeout(deadline, transport.connect(&url)).await {
                    Ok(result) => result,
                    Err(_) => Err(PhoneError::Timeout {
                        duration_ms: deadline.as_millis() as u64,
                    }),
                }
            },
            move |result| SessionEvent::SignallingConnected { attempt, result },
        );
    }

    pub(super) fn on_signalling_connected(&mut self, attempt: u64, result: PhoneResult<SignallingLink>) {
        if !self.channel.is_current_attempt(attempt) {
            debug!(attempt, "Result of an abandoned signalling connect dropped");
            if let Ok(link) = result {
                let _ = link.outbound.send(OutboundFrame::Close {
                    code: CLOSE_NORMAL,
                    reason: "superseded".to_string(),
                });
            }
            return;
        }

        match result {
            Ok(SignallingLink { outbound, mut inbound }) => {
                let link_id = self.channel.attach(outbound);
                let events = self.events.clone();
                let pump = tokio::spawn(async move {
                    while let Some(event) = inbound.recv().await {
                        if events.send(SessionEvent::Link { link_id, event }).is_err() {
                            break;
                        }
                    }
                });
                if let Some(previous) = self.link_pump.replace(pump) {
                    previous.abort();
                }
                info!(link_id, "Signalling connected");
                if let Some(step) = self.channel.apply(ChannelEvent::Opened, Instant::now()) {
                    self.run_channel_actions(step.actions);
                }
            }
            Err(err) => {
                if let Some(step) = self.channel.apply(
                    ChannelEvent::ConnectFailed {
                        reason: err.to_string(),
                    },
                    Instant::now(),
                ) {
                    self.run_channel_actions(step.actions);
                }
            }
        }
    }

    pub(super) fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Text(text) => {
                // any inbound frame proves the link alive
                self.channel.apply(ChannelEvent::MessageReceived, Instant::now());
                match InboundMessage::parse(&text) {
                    Ok(message) => self.on_signalling_message(message),
                    Err(err) => warn!(error = %err, "Malformed signalling message dropped"),
                }
            }
            LinkEvent::Closed { code, reason } => {
                debug!(code, reason = %reason, "Signalling link closed");
                if let Some(step) = self.channel.apply(ChannelEvent::Closed { code }, Instant::now()) {
                    self.run_channel_actions(step.actions);
                }
            }
        }
    }

    fn on_signalling_message(&mut self, message: InboundMessage) {
        match &message {
            InboundMessage::RegistrationSuccess => {
                info!(agent_id = %self.config.agent_id, "Agent registered with call routing");
                self.last_error = None;
                self.notify(SessionNotice::AgentRegistered);
            }
            InboundMessage::RegistrationError { .. } => {
                let reason = message
                    .error_reason()
                    .unwrap_or_else(|| "agent registration rejected".to_string());
                warn!(reason = %reason, "Agent registration refused");
                self.last_error = Some(reason.clone());
                self.notify(SessionNotice::RegistrationError { message: reason });
            }
            InboundMessage::Pong => trace!("Pong"),
            InboundMessage::IncomingCall { data } | InboundMessage::CallEnded { data } => {
                debug!(?data, "Advisory call notice from routing server");
            }
            InboundMessage::Unknown => debug!("Unknown signalling message ignored"),
        }
    }

    fn send_register(&mut self) {
        let Some(token) = self.refresher.token() else {
            warn!("No access token yet, agent announcement deferred");
            self.register_pending = true;
            return;
        };
        let message = OutboundMessage::AgentRegister {
            agent_id: self.config.agent_id.clone(),
            token: token.to_string(),
        };
        match self.channel.send(&message) {
            Ok(()) => self.register_pending = false,
            Err(err) => warn!(error = %err, "Agent announcement not sent"),
        }
    }

    pub(super) fn send_ping(&self) {
        if let Err(err) = self.channel.send(&OutboundMessage::Ping) {
            debug!(error = %err, "Ping skipped");
        }
    }

    pub(super) fn publish_status(&self, status: AgentStatus) {
        let message = OutboundMessage::StatusUpdate {
            agent_id: self.config.agent_id.clone(),
            status,
        };
        match self.channel.send(&message) {
            Ok(()) => info!(status = %status, "Agent status published"),
            Err(err) => debug!(status = %status, error = %err, "Agent status not published"),
        }
    }

    // ---- manual reconnect ----

    /// Reconnect whatever leg is down with backoff starting from scratch
    pub(super) fn reconnect(&mut self) -> PhoneResult<()> {
        let now = Instant::now();
        info!(
            signalling = %self.channel.state(),
            device = %self.registration.state(),
            "Manual reconnect requested"
        );
        self.last_error = None;

        self.channel.reset_attempts();
        match self.channel.state() {
            SignallingState::Connected if self.channel.is_healthy(now) => {}
            SignallingState::Connected => {
                // stale link: replace it
                if let Some(step) = self.channel.close_locally(now) {
                    self.run_channel_actions(step.actions);
                }
                self.connect_signalling();
            }
            SignallingState::Connecting => debug!("Signalling connect already in progress"),
            SignallingState::Disconnected | SignallingState::Error => self.connect_signalling(),
        }

        match self.registration.state() {
            RegistrationState::Registered | RegistrationState::Initializing => {}
            RegistrationState::Uninitialized | RegistrationState::Unregistered | RegistrationState::Error => {
                self.registration.reset_attempts();
                self.timers.cancel(TimerKind::RegistrationRetry);
                self.timers.cancel(TimerKind::ReRegister);
                self.fetch_token(RefreshTrigger::RegistrationRetry);
            }
        }
        Ok(())
    }
}
