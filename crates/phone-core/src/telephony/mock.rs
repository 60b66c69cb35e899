//! Simulated telephony SDK
//!
//! Behaves like the browser soft-phone SDK closely enough to drive the session
//! manager end to end: devices register (or fail to, on demand), calls can be
//! rung in, and every operation the session manager performs is recorded so
//! tests can assert on it.
//!
//! ```rust
//! use agentdesk_phone_core::telephony::mock::MockTelephony;
//! use agentdesk_phone_core::telephony::{DeviceOptions, TelephonyConnector};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let telephony = MockTelephony::new();
//! telephony.fail_next_registrations(1);
//!
//! let handle = telephony.create_device("token-1", &DeviceOptions::default()).await.unwrap();
//! assert!(handle.device.register().await.is_err());
//! assert!(handle.device.register().await.is_ok());
//! assert_eq!(telephony.register_times().len(), 2);
//! # }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    CallHandle, CallObjectEvent, CallQualityMetrics, DeviceEvent, DeviceHandle, DeviceOptions,
    TelephonyCall, TelephonyConnector, TelephonyDevice,
};
use crate::config::AcceptConstraints;
use crate::error::{PhoneError, PhoneResult};

#[derive(Debug, Default)]
struct Shared {
    register_failures: AtomicU32,
    register_log: Mutex<Vec<Instant>>,
    calls: Mutex<Vec<Arc<MockCall>>>,
}

/// Simulated [`TelephonyConnector`]
#[derive(Debug, Clone, Default)]
pub struct MockTelephony {
    shared: Arc<Shared>,
    devices: Arc<Mutex<Vec<Arc<MockDevice>>>>,
    create_failures: Arc<AtomicU32>,
}

impl MockTelephony {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `register()` fail
    pub fn fail_next_registrations(&self, count: u32) {
        self.shared.register_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` device constructions fail
    pub fn fail_next_device_creations(&self, count: u32) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn latest_device(&self) -> Option<Arc<MockDevice>> {
        self.devices.lock().last().cloned()
    }

    pub fn devices(&self) -> Vec<Arc<MockDevice>> {
        self.devices.lock().clone()
    }

    /// When each `register()` call happened, successful or not
    pub fn register_times(&self) -> Vec<Instant> {
        self.shared.register_log.lock().clone()
    }

    /// Every call object created so far, inbound and outbound
    pub fn calls(&self) -> Vec<Arc<MockCall>> {
        self.shared.calls.lock().clone()
    }

    /// Ring an incoming call on the latest device
    ///
    /// Returns `None` when no live device exists.
    pub fn ring(&self, from: &str) -> Option<Arc<MockCall>> {
        let device = self.latest_device()?;
        if device.is_destroyed() {
            return None;
        }
        let (call, handle) = MockCall::create(from);
        self.shared.calls.lock().push(call.clone());
        device.emit(DeviceEvent::Incoming(handle)).then_some(call)
    }
}

#[async_trait]
impl TelephonyConnector for MockTelephony {
    async fn create_device(&self, token: &str, options: &DeviceOptions) -> PhoneResult<DeviceHandle> {
        let pending = self.create_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.create_failures.store(pending - 1, Ordering::SeqCst);
            return Err(PhoneError::device("simulated device construction failure"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut devices = self.devices.lock();
        let device = Arc::new(MockDevice {
            id: devices.len(),
            options: options.clone(),
            tokens: Mutex::new(vec![token.to_string()]),
            events: tx,
            registrations: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            input_device: Mutex::new(None),
            speaker_devices: Mutex::new(Vec::new()),
            speaker_tests: AtomicU32::new(0),
            fail_device_selection: AtomicBool::new(false),
            shared: self.shared.clone(),
        });
        devices.push(device.clone());

        Ok(DeviceHandle { device, events: rx })
    }
}

/// Simulated [`TelephonyDevice`]
#[derive(Debug)]
pub struct MockDevice {
    id: usize,
    options: DeviceOptions,
    tokens: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    registrations: AtomicU32,
    destroyed: AtomicBool,
    input_device: Mutex<Option<String>>,
    speaker_devices: Mutex<Vec<String>>,
    speaker_tests: AtomicU32,
    fail_device_selection: AtomicBool,
    shared: Arc<Shared>,
}

impl MockDevice {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Deliver an SDK event; returns `false` once nobody listens anymore
    pub fn emit(&self, event: DeviceEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Construction token followed by every `update_token` value
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn successful_registrations(&self) -> u32 {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn input_device(&self) -> Option<String> {
        self.input_device.lock().clone()
    }

    pub fn speaker_devices(&self) -> Vec<String> {
        self.speaker_devices.lock().clone()
    }

    pub fn speaker_tests(&self) -> u32 {
        self.speaker_tests.load(Ordering::SeqCst)
    }

    /// Make audio device selection fail until switched back
    pub fn fail_device_selection(&self, fail: bool) {
        self.fail_device_selection.store(fail, Ordering::SeqCst);
    }

    fn ensure_alive(&self) -> PhoneResult<()> {
        if self.is_destroyed() {
            Err(PhoneError::device(format!("device {} was destroyed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelephonyDevice for MockDevice {
    async fn register(&self) -> PhoneResult<()> {
        self.ensure_alive()?;
        self.shared.register_log.lock().push(Instant::now());

        let pending = self.shared.register_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.shared.register_failures.store(pending - 1, Ordering::SeqCst);
            return Err(PhoneError::device("simulated registration rejection"));
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unregister(&self) -> PhoneResult<()> {
        self.ensure_alive()?;
        let _ = self.events.send(DeviceEvent::Unregistered);
        Ok(())
    }

    async fn update_token(&self, token: &str) -> PhoneResult<()> {
        self.ensure_alive()?;
        self.tokens.lock().push(token.to_string());
        Ok(())
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    async fn connect(&self, to: &str) -> PhoneResult<CallHandle> {
        self.ensure_alive()?;
        let (call, handle) = MockCall::create(to);
        self.shared.calls.lock().push(call);
        Ok(handle)
    }

    async fn set_input_device(&self, device_id: &str) -> PhoneResult<()> {
        self.ensure_alive()?;
        if self.fail_device_selection.load(Ordering::SeqCst) {
            return Err(PhoneError::media(format!("cannot open input {}", device_id)));
        }
        *self.input_device.lock() = Some(device_id.to_string());
        Ok(())
    }

    async fn set_speaker_devices(&self, device_ids: &[String]) -> PhoneResult<()> {
        self.ensure_alive()?;
        if self.fail_device_selection.load(Ordering::SeqCst) {
            return Err(PhoneError::media("cannot route output"));
        }
        *self.speaker_devices.lock() = device_ids.to_vec();
        Ok(())
    }

    async fn test_speaker(&self) -> PhoneResult<()> {
        self.ensure_alive()?;
        self.speaker_tests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulated [`TelephonyCall`]
#[derive(Debug)]
pub struct MockCall {
    remote: String,
    events: mpsc::UnboundedSender<CallObjectEvent>,
    accepts: AtomicU32,
    rejects: AtomicU32,
    disconnects: AtomicU32,
    mutes: Mutex<Vec<bool>>,
    fail_mute: AtomicBool,
    metrics: Mutex<Option<CallQualityMetrics>>,
}

impl MockCall {
    fn create(remote: &str) -> (Arc<MockCall>, CallHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let call = Arc::new(MockCall {
            remote: remote.to_string(),
            events: tx,
            accepts: AtomicU32::new(0),
            rejects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            mutes: Mutex::new(Vec::new()),
            fail_mute: AtomicBool::new(false),
            metrics: Mutex::new(None),
        });
        let handle = CallHandle {
            call: call.clone(),
            events: rx,
        };
        (call, handle)
    }

    /// Deliver a call event; returns `false` once nobody listens anymore
    pub fn emit(&self, event: CallObjectEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn accepts(&self) -> u32 {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn rejects(&self) -> u32 {
        self.rejects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Every value passed to `mute()`, in order
    pub fn mute_calls(&self) -> Vec<bool> {
        self.mutes.lock().clone()
    }

    pub fn fail_mute(&self, fail: bool) {
        self.fail_mute.store(fail, Ordering::SeqCst);
    }

    pub fn set_metrics(&self, metrics: Option<CallQualityMetrics>) {
        *self.metrics.lock() = metrics;
    }
}

#[async_trait]
impl TelephonyCall for MockCall {
    fn remote_identity(&self) -> String {
        self.remote.clone()
    }

    async fn accept(&self, _constraints: &AcceptConstraints) -> PhoneResult<()> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        // the real SDK confirms with an accept event once media is up
        let _ = self.events.send(CallObjectEvent::Accepted);
        Ok(())
    }

    async fn reject(&self) -> PhoneResult<()> {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> PhoneResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(CallObjectEvent::Disconnected);
        Ok(())
    }

    async fn mute(&self, muted: bool) -> PhoneResult<()> {
        self.mutes.lock().push(muted);
        if self.fail_mute.load(Ordering::SeqCst) {
            return Err(PhoneError::media("mute rejected by call object"));
        }
        Ok(())
    }

    async fn quality_metrics(&self) -> Option<CallQualityMetrics> {
        self.metrics.lock().clone()
    }
}
