//! Session task: event loop, dispatch and publishing

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{SessionDeps, SessionSnapshot};
use crate::audio::{AudioDeviceMonitor, CaptureStream};
use crate::call::{CallId, CallSessionMachine};
use crate::config::SessionConfig;
use crate::connection::ConnectionState;
use crate::credential::{Credential, CredentialRefresher, RefreshTrigger, TokenProvider};
use crate::error::{PhoneError, PhoneResult};
use crate::events::{Notifier, SessionNotice};
use crate::registration::DeviceRegistrationManager;
use crate::signalling::{LinkEvent, SignallingChannel, SignallingLink, SignallingTransport};
use crate::telephony::{CallObjectEvent, DeviceEvent, DeviceOptions, TelephonyCall};
use crate::timer::{TimerFired, TimerKind, Timers};

pub(super) type Reply = oneshot::Sender<PhoneResult<()>>;

/// Requests from [`super::SessionHandle`]
pub(super) enum Command {
    Accept(Reply),
    Reject(Reply),
    End(Reply),
    ToggleMute(Reply),
    Dial { to: String, reply: Reply },
    SelectInput { device_id: String, reply: Reply },
    SelectOutput { device_id: String, reply: Reply },
    TestSpeaker(Reply),
    RefreshDevices(Reply),
    RetryMicrophone(Reply),
    Reconnect(Reply),
    Shutdown(Reply),
}

/// Results and notifications posted back to the session task
pub(super) enum SessionEvent {
    TokenFetched {
        trigger: RefreshTrigger,
        result: PhoneResult<Credential>,
    },
    Device {
        generation: u64,
        event: DeviceEvent,
    },
    RegisterResult {
        generation: u64,
        result: PhoneResult<()>,
    },
    SignallingConnected {
        attempt: u64,
        result: PhoneResult<SignallingLink>,
    },
    Link {
        link_id: u64,
        event: LinkEvent,
    },
    Call {
        call_id: CallId,
        event: CallObjectEvent,
    },
    Microphone(PhoneResult<CaptureStream>),
    InputLevel(f32),
    DevicesChanged,
}

/// Receiving ends owned by the loop
pub(super) struct Inbox {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
}

/// The call object of the live call and the task forwarding its events
pub(super) struct LiveCall {
    pub(super) id: CallId,
    pub(super) call: Arc<dyn TelephonyCall>,
    pub(super) pump: JoinHandle<()>,
}

impl LiveCall {
    pub(super) fn release(self) {
        self.pump.abort();
    }
}

pub(super) struct SessionActor {
    pub(super) config: SessionConfig,
    pub(super) tokens: Arc<dyn TokenProvider>,
    pub(super) transport: Arc<dyn SignallingTransport>,
    pub(super) notifier: Arc<dyn Notifier>,

    pub(super) refresher: CredentialRefresher,
    pub(super) registration: DeviceRegistrationManager,
    pub(super) channel: SignallingChannel,
    pub(super) calls: CallSessionMachine,
    pub(super) audio: AudioDeviceMonitor,
    pub(super) timers: Timers,

    pub(super) live_call: Option<LiveCall>,
    /// Task forwarding inbound frames of the current signalling link
    pub(super) link_pump: Option<JoinHandle<()>>,
    /// Signalling was started once; later connects come from its own retry logic
    pub(super) signalling_started: bool,
    /// Agent announcement is waiting for the first token
    pub(super) register_pending: bool,
    pub(super) last_error: Option<String>,
    was_healthy: bool,
    shut_down: bool,
    background: Vec<JoinHandle<()>>,

    pub(super) events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionActor {
    pub(super) fn new(
        config: SessionConfig,
        deps: SessionDeps,
        snapshot: watch::Sender<SessionSnapshot>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> (Self, Inbox) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let timing = &config.timing;

        let actor = Self {
            refresher: CredentialRefresher::new(timing.token_refresh_interval, timing.token_retry_delay),
            registration: DeviceRegistrationManager::new(
                deps.telephony,
                DeviceOptions::default(),
                timing.registration_backoff,
                timing.reregister_delay,
            ),
            channel: SignallingChannel::new(timing.signalling_backoff, timing.heartbeat_stale_after),
            calls: CallSessionMachine::new(timing.answer_timeout),
            audio: AudioDeviceMonitor::new(deps.media, timing.level_sample_interval),
            timers: Timers::new(timers_tx),
            tokens: deps.tokens,
            transport: deps.transport,
            notifier: deps.notifier,
            live_call: None,
            link_pump: None,
            signalling_started: false,
            register_pending: false,
            last_error: None,
            was_healthy: false,
            shut_down: false,
            background: Vec::new(),
            events: events_tx,
            snapshot,
            notices,
            config,
        };
        let inbox = Inbox {
            events: events_rx,
            timers: timers_rx,
        };
        (actor, inbox)
    }

    /// Run until shutdown or until every handle is gone
    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbox: Inbox) {
        self.boot().await;
        self.publish();

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.dispatch_command(command).await,
                    None => {
                        info!("All session handles dropped, shutting down");
                        ControlFlow::Break(())
                    }
                },
                Some(event) = inbox.events.recv() => {
                    self.dispatch_event(event).await;
                    ControlFlow::Continue(())
                }
                Some(fired) = inbox.timers.recv() => {
                    self.dispatch_timer(fired).await;
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
            self.publish();
        }

        if !self.shut_down {
            self.teardown().await;
        }
        self.publish();
        debug!("Session task exited");
    }

    async fn boot(&mut self) {
        self.request_microphone(None);

        if let Err(err) = self.audio.refresh_device_list().await {
            self.report(&err);
        }

        let mut changes = self.audio.backend().device_changes();
        let events = self.events.clone();
        self.background.push(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if events.send(SessionEvent::DevicesChanged).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        self.timers
            .arm_repeating(TimerKind::HealthCheck, self.config.timing.health_check_interval, None);
        self.fetch_token(RefreshTrigger::Initial);
    }

    async fn dispatch_command(&mut self, command: Command) -> ControlFlow<()> {
        match AssertUnwindSafe(self.handle_command(command)).catch_unwind().await {
            Ok(flow) => flow,
            Err(panic) => {
                self.report(&PhoneError::internal(panic_message(panic)));
                ControlFlow::Continue(())
            }
        }
    }

    async fn dispatch_event(&mut self, event: SessionEvent) {
        if let Err(panic) = AssertUnwindSafe(self.handle_event(event)).catch_unwind().await {
            self.report(&PhoneError::internal(panic_message(panic)));
        }
    }

    async fn dispatch_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(&fired) {
            return;
        }
        if let Err(panic) = AssertUnwindSafe(self.handle_timer(fired)).catch_unwind().await {
            self.report(&PhoneError::internal(panic_message(panic)));
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        let (reply, result) = match command {
            Command::Accept(reply) => (reply, self.accept().await),
            Command::Reject(reply) => (reply, self.reject().await),
            Command::End(reply) => (reply, self.end().await),
            Command::ToggleMute(reply) => (reply, self.toggle_mute().await),
            Command::Dial { to, reply } => (reply, self.dial(&to).await),
            Command::SelectInput { device_id, reply } => (reply, self.select_input(&device_id).await),
            Command::SelectOutput { device_id, reply } => (reply, self.select_output(&device_id).await),
            Command::TestSpeaker(reply) => (reply, self.test_speaker().await),
            Command::RefreshDevices(reply) => (reply, self.audio.refresh_device_list().await),
            Command::RetryMicrophone(reply) => {
                let selected = self.audio.state().selected_input.clone();
                self.request_microphone(selected);
                (reply, Ok(()))
            }
            Command::Reconnect(reply) => (reply, self.reconnect()),
            Command::Shutdown(reply) => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        };

        if let Err(err) = &result {
            self.report(err);
        }
        let _ = reply.send(result);
        ControlFlow::Continue(())
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TokenFetched { trigger, result } => self.on_token(trigger, result).await,
            SessionEvent::Device { generation, event } => {
                if !self.registration.is_current(generation) {
                    debug!(generation, "Event from a replaced device dropped");
                    return;
                }
                self.on_device_event(event).await;
            }
            SessionEvent::RegisterResult { generation, result } => {
                if !self.registration.is_current(generation) {
                    debug!(generation, "Register result for a replaced device dropped");
                    return;
                }
                self.on_register_result(result);
            }
            SessionEvent::SignallingConnected { attempt, result } => self.on_signalling_connected(attempt, result),
            SessionEvent::Link { link_id, event } => {
                if !self.channel.is_current_link(link_id) {
                    debug!(link_id, "Event from a superseded signalling link dropped");
                    return;
                }
                self.on_link_event(event);
            }
            SessionEvent::Call { call_id, event } => self.on_call_object_event(call_id, event).await,
            SessionEvent::Microphone(result) => self.on_microphone(result),
            SessionEvent::InputLevel(level) => self.audio.set_input_level(level),
            SessionEvent::DevicesChanged => {
                if let Err(err) = self.audio.refresh_device_list().await {
                    self.report(&err);
                }
            }
        }
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        match fired.kind {
            TimerKind::AnswerTimeout | TimerKind::DurationTick | TimerKind::QualityCheck => {
                self.on_call_timer(fired).await
            }
            TimerKind::Heartbeat => self.send_ping(),
            TimerKind::HealthCheck => self.check_health(),
            TimerKind::SignallingReconnect => self.connect_signalling(),
            TimerKind::TokenRefresh => self.fetch_token(RefreshTrigger::Scheduled),
            TimerKind::TokenRefreshRetry => self.fetch_token(RefreshTrigger::ScheduledRetry),
            TimerKind::RegistrationRetry => self.fetch_token(RefreshTrigger::RegistrationRetry),
            TimerKind::ReRegister => self.reregister(),
        }
    }

    fn check_health(&mut self) {
        let healthy = self.connection_state(Instant::now()).healthy;
        if healthy != self.was_healthy {
            if healthy {
                info!("Connection healthy");
            } else {
                warn!(
                    signalling = %self.channel.state(),
                    device = %self.registration.state(),
                    "Connection health lost"
                );
            }
            self.was_healthy = healthy;
        }
    }

    /// Run `operation` on its own task and post the outcome back
    ///
    /// A panic inside the operation is caught and delivered as an internal
    /// error so the waiting state machine still gets its result.
    pub(super) fn spawn_operation<T, Fut, Wrap>(&self, operation: Fut, wrap: Wrap)
    where
        T: Send + 'static,
        Fut: Future<Output = PhoneResult<T>> + Send + 'static,
        Wrap: FnOnce(PhoneResult<T>) -> SessionEvent + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(PhoneError::internal(panic_message(panic))),
            };
            if events.send(wrap(result)).is_err() {
                debug!("Session gone, operation result dropped");
            }
        });
    }

    /// Log an error with its category and surface it as a notice
    pub(super) fn report(&self, err: &PhoneError) {
        warn!(error = %err, category = err.category(), "Session error");
        let notice = match err {
            PhoneError::MediaPermission { reason } => SessionNotice::MicrophoneDenied {
                message: reason.clone(),
            },
            _ => SessionNotice::Error {
                category: err.category().to_string(),
                message: err.to_string(),
            },
        };
        self.notify(notice);
    }

    pub(super) fn notify(&self, notice: SessionNotice) {
        debug!(?notice, "Session notice");
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    pub(super) fn connection_state(&self, now: Instant) -> ConnectionState {
        ConnectionState::evaluate(&self.channel, &self.registration, now)
    }

    fn publish(&self) {
        let connection = self.connection_state(Instant::now());
        let snapshot = SessionSnapshot {
            call: self.calls.snapshot(),
            audio: self.audio.state().clone(),
            status: connection.status_level(),
            status_message: connection.status_message(),
            can_reconnect: !self.shut_down && connection.can_reconnect(),
            connection,
            last_error: self.last_error.clone(),
            shut_down: self.shut_down,
        };
        self.snapshot.send_replace(snapshot);
    }

    /// Release everything in a fixed order
    ///
    /// Timers, then the signalling socket (code 1000), then the live call and
    /// the device, then the microphone capture, then level analysis.
    pub(super) async fn teardown(&mut self) {
        info!("Tearing down agent phone session");
        self.timers.cancel_all();

        if let Some(step) = self.channel.close_locally(Instant::now()) {
            self.run_channel_actions(step.actions);
        }

        if self.live_call.is_some() || self.calls.current_call_id().is_some() {
            if let Some(live) = &self.live_call {
                if let Err(err) = live.call.disconnect().await {
                    debug!(error = %err, "Disconnect during teardown failed");
                }
            }
            let step = self.calls.reset_call_session(crate::call::EndReason::LocalHangup);
            self.run_call_effects(step.effects).await;
        }
        self.registration.destroy().await;

        self.audio.stop_capture();
        self.audio.stop_level_analysis();

        if let Some(pump) = self.link_pump.take() {
            pump.abort();
        }
        for task in self.background.drain(..) {
            task.abort();
        }
        self.timers.cancel_all();
        self.shut_down = true;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(detail = %detail, "Panic caught in session task");
    format!("unexpected failure: {}", detail)
}
