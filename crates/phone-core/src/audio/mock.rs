//! Simulated media platform
//!
//! Produces a synthetic microphone signal (constant amplitude, 20ms frames at
//! 16kHz) and a small default device inventory. Permission can be denied and
//! devices plugged or unplugged at runtime to exercise hot-plug handling.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::backend::{CaptureControl, CaptureStream, MediaBackend};
use super::device::{AudioDeviceInfo, AudioDirection, AudioFrame};
use crate::error::{PhoneError, PhoneResult};

const SAMPLE_RATE: u32 = 16_000;
const FRAME_MS: u32 = 20;

#[derive(Debug)]
struct Inner {
    devices: Mutex<Vec<AudioDeviceInfo>>,
    deny: AtomicBool,
    fail_enumeration: AtomicBool,
    amplitude: Mutex<i16>,
    requests: Mutex<Vec<Option<String>>>,
    stopped: AtomicU32,
    changes: broadcast::Sender<()>,
}

/// Simulated [`MediaBackend`]
#[derive(Debug, Clone)]
pub struct MockMediaBackend {
    inner: Arc<Inner>,
}

impl MockMediaBackend {
    pub fn new() -> Self {
        Self::with_devices(default_devices())
    }

    pub fn with_devices(devices: Vec<AudioDeviceInfo>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                devices: Mutex::new(devices),
                deny: AtomicBool::new(false),
                fail_enumeration: AtomicBool::new(false),
                amplitude: Mutex::new(0),
                requests: Mutex::new(Vec::new()),
                stopped: AtomicU32::new(0),
                changes,
            }),
        }
    }

    /// Refuse (or grant again) microphone access
    pub fn deny_microphone(&self, deny: bool) {
        self.inner.deny.store(deny, Ordering::SeqCst);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.inner.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// Amplitude of the synthetic microphone signal
    pub fn set_input_amplitude(&self, amplitude: i16) {
        *self.inner.amplitude.lock() = amplitude;
    }

    /// Add a device and fire a hot-plug notification
    pub fn plug(&self, device: AudioDeviceInfo) {
        self.inner.devices.lock().push(device);
        let _ = self.inner.changes.send(());
    }

    /// Remove a device and fire a hot-plug notification
    pub fn unplug(&self, device_id: &str) {
        self.inner.devices.lock().retain(|d| d.id != device_id);
        let _ = self.inner.changes.send(());
    }

    /// Device requested by every `request_microphone` call, in order
    pub fn capture_requests(&self) -> Vec<Option<String>> {
        self.inner.requests.lock().clone()
    }

    /// Number of capture streams that have shut down
    pub fn captures_stopped(&self) -> u32 {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Default for MockMediaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBackend for MockMediaBackend {
    async fn request_microphone(&self, device_id: Option<&str>) -> PhoneResult<CaptureStream> {
        self.inner.requests.lock().push(device_id.map(str::to_string));
        if self.inner.deny.load(Ordering::SeqCst) {
            return Err(PhoneError::MediaPermission {
                reason: "NotAllowedError: permission denied by user".to_string(),
            });
        }

        let opened = match device_id {
            Some(id) => {
                let known = self.inner.devices.lock().iter().any(|d| d.id == id);
                if !known {
                    return Err(PhoneError::media(format!("NotFoundError: no input {}", id)));
                }
                Some(id.to_string())
            }
            None => self
                .inner
                .devices
                .lock()
                .iter()
                .find(|d| d.direction == AudioDirection::Input && d.is_default)
                .map(|d| d.id.clone()),
        };

        let (tx, rx) = mpsc::channel(32);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS as u64));
            let mut timestamp_ms = 0u64;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let amplitude = *inner.amplitude.lock();
                        let frame = AudioFrame::constant(amplitude, SAMPLE_RATE, FRAME_MS, timestamp_ms);
                        timestamp_ms += FRAME_MS as u64;
                        // a full channel just drops the frame, like a real capture buffer
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(frame) {
                            break;
                        }
                    }
                }
            }
            inner.stopped.fetch_add(1, Ordering::SeqCst);
        });

        Ok(CaptureStream {
            device_id: opened,
            frames: rx,
            control: CaptureControl::new(stop_tx),
        })
    }

    async fn enumerate_devices(&self) -> PhoneResult<Vec<AudioDeviceInfo>> {
        if self.inner.fail_enumeration.load(Ordering::SeqCst) {
            return Err(PhoneError::media("device enumeration unavailable"));
        }
        Ok(self.inner.devices.lock().clone())
    }

    fn device_changes(&self) -> broadcast::Receiver<()> {
        self.inner.changes.subscribe()
    }
}

fn default_devices() -> Vec<AudioDeviceInfo> {
    vec![
        AudioDeviceInfo::input("default-mic", "Built-in Microphone").as_default(),
        AudioDeviceInfo::input("headset-mic", "USB Headset Microphone"),
        AudioDeviceInfo::output("default-speaker", "Built-in Speakers").as_default(),
        AudioDeviceInfo::output("headset-speaker", "USB Headset"),
    ]
}
