//! Microphone and audio device actions

use tracing::debug;

use super::actor::{SessionActor, SessionEvent};
use crate::audio::CaptureStream;
use crate::error::{PhoneError, PhoneResult};

impl SessionActor {
    /// Ask the media backend for a capture stream; the result arrives as an event
    pub(super) fn request_microphone(&self, device_id: Option<String>) {
        let backend = self.audio.backend();
        debug!(device = ?device_id, "Requesting microphone access");
        self.spawn_operation(
            async move { backend.request_microphone(device_id.as_deref()).await },
            SessionEvent::Microphone,
        );
    }

    pub(super) fn on_microphone(&mut self, result: PhoneResult<CaptureStream>) {
        let events = self.events.clone();
        let on_level = move |level| {
            let _ = events.send(SessionEvent::InputLevel(level));
        };
        if let Err(err) = self.audio.on_microphone_result(result, on_level) {
            self.report(&err);
        }
    }

    pub(super) async fn select_input(&mut self, device_id: &str) -> PhoneResult<()> {
        let device = self
            .registration
            .device()
            .ok_or_else(|| PhoneError::invalid_state("select input device", self.registration.state()))?;
        self.audio.set_input_device(device.as_ref(), device_id).await?;

        // move the level meter onto the new input
        if self.audio.state().has_mic_permission {
            self.request_microphone(Some(device_id.to_string()));
        }
        Ok(())
    }

    pub(super) async fn select_output(&mut self, device_id: &str) -> PhoneResult<()> {
        let device = self
            .registration
            .device()
            .ok_or_else(|| PhoneError::invalid_state("select output device", self.registration.state()))?;
        self.audio.set_output_device(device.as_ref(), device_id).await
    }

    pub(super) async fn test_speaker(&mut self) -> PhoneResult<()> {
        let device = self
            .registration
            .device()
            .ok_or_else(|| PhoneError::invalid_state("test speaker", self.registration.state()))?;
        self.audio.test_speaker(device.as_ref()).await
    }
}
