//! Platform media seam
//!
//! Microphone capture, device enumeration and hot-plug notifications come from
//! the platform (the browser media APIs in the console, a sound server on a
//! desktop). [`MediaBackend`] is everything the audio monitor needs from it.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::device::{AudioDeviceInfo, AudioFrame};
use crate::error::PhoneResult;

/// Capability the audio device monitor depends on
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Ask for microphone access and open a capture stream
    ///
    /// `device_id` selects a specific input; `None` takes the platform default.
    /// A refusal must be reported as [`crate::error::PhoneError::MediaPermission`].
    async fn request_microphone(&self, device_id: Option<&str>) -> PhoneResult<CaptureStream>;

    /// List every input and output device currently present
    async fn enumerate_devices(&self) -> PhoneResult<Vec<AudioDeviceInfo>>;

    /// Subscribe to hot-plug notifications
    fn device_changes(&self) -> broadcast::Receiver<()>;
}

/// Stops a capture stream
///
/// Dropping the control stops the stream as well.
#[derive(Debug)]
pub struct CaptureControl {
    stop: Option<oneshot::Sender<()>>,
}

impl CaptureControl {
    pub fn new(stop: oneshot::Sender<()>) -> Self {
        Self { stop: Some(stop) }
    }

    /// Stop capturing; the frame channel closes shortly after
    pub fn stop(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for CaptureControl {
    fn drop(&mut self) {
        self.signal();
    }
}

/// An open microphone capture
pub struct CaptureStream {
    /// Input actually opened
    pub device_id: Option<String>,
    pub frames: mpsc::Receiver<AudioFrame>,
    pub control: CaptureControl,
}

impl fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureStream")
            .field("device_id", &self.device_id)
            .finish()
    }
}
