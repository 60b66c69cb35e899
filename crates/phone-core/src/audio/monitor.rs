//! Audio device monitor
//!
//! Maintains microphone permission, the device inventory and the live input
//! level for the console. The monitor is owned by the session task; the only
//! concurrent piece is the level sampler, which reads captured frames on every
//! display tick and reports level changes through a callback.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::{CaptureControl, CaptureStream, MediaBackend};
use super::device::{AudioDeviceInfo, AudioDirection, AudioFrame};
use super::level::{frame_level, LevelMeter};
use crate::error::{PhoneError, PhoneResult};
use crate::telephony::TelephonyDevice;

/// Smallest level change worth reporting
const LEVEL_EPSILON: f32 = 0.01;

/// Live audio information shown by the console
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioState {
    /// Microphone level in `[0, 1]`
    pub input_level: f32,
    /// Remote party level in `[0, 1]`, fed by call volume events
    pub output_level: f32,
    pub muted: bool,
    pub input_devices: Vec<AudioDeviceInfo>,
    pub output_devices: Vec<AudioDeviceInfo>,
    pub selected_input: Option<String>,
    pub selected_output: Option<String>,
    pub has_mic_permission: bool,
}

/// Permission, inventory and level tracking
pub struct AudioDeviceMonitor {
    backend: Arc<dyn MediaBackend>,
    state: AudioState,
    capture: Option<CaptureControl>,
    sampler: Option<JoinHandle<()>>,
    sample_interval: Duration,
}

impl AudioDeviceMonitor {
    pub fn new(backend: Arc<dyn MediaBackend>, sample_interval: Duration) -> Self {
        Self {
            backend,
            state: AudioState::default(),
            capture: None,
            sampler: None,
            sample_interval,
        }
    }

    pub fn state(&self) -> &AudioState {
        &self.state
    }

    pub fn backend(&self) -> Arc<dyn MediaBackend> {
        self.backend.clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Apply the outcome of a microphone request
    ///
    /// On success the previous capture (if any) is replaced and the level
    /// sampler restarted on the new stream. A denial clears the permission
    /// flag and is returned so the caller can surface it; it is never retried.
    pub fn on_microphone_result<F>(&mut self, result: PhoneResult<CaptureStream>, on_level: F) -> PhoneResult<()>
    where
        F: Fn(f32) + Send + 'static,
    {
        match result {
            Ok(stream) => {
                self.stop_capture();
                self.stop_level_analysis();

                info!(device = ?stream.device_id, "Microphone capture started");
                self.state.has_mic_permission = true;
                if self.state.selected_input.is_none() {
                    self.state.selected_input = stream.device_id.clone();
                }
                self.capture = Some(stream.control);
                self.sampler = Some(spawn_sampler(stream.frames, self.sample_interval, on_level));
                Ok(())
            }
            Err(err) => {
                if matches!(err, PhoneError::MediaPermission { .. }) {
                    self.state.has_mic_permission = false;
                }
                warn!(error = %err, category = err.category(), "Microphone request failed");
                Err(err)
            }
        }
    }

    /// Re-enumerate devices and replace both lists wholesale
    ///
    /// A selection whose device disappeared is dropped.
    pub async fn refresh_device_list(&mut self) -> PhoneResult<()> {
        let devices = self.backend.enumerate_devices().await?;
        let (inputs, outputs): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|d| d.direction == AudioDirection::Input);

        if let Some(selected) = &self.state.selected_input {
            if !inputs.iter().any(|d| &d.id == selected) {
                info!(device = %selected, "Selected input device disappeared");
                self.state.selected_input = None;
            }
        }
        if let Some(selected) = &self.state.selected_output {
            if !outputs.iter().any(|d| &d.id == selected) {
                info!(device = %selected, "Selected output device disappeared");
                self.state.selected_output = None;
            }
        }

        debug!(inputs = inputs.len(), outputs = outputs.len(), "Audio device list refreshed");
        self.state.input_devices = inputs;
        self.state.output_devices = outputs;
        Ok(())
    }

    /// Route the call's microphone through `device_id`
    ///
    /// The previous selection stays in effect when the SDK refuses.
    pub async fn set_input_device(&mut self, device: &dyn TelephonyDevice, device_id: &str) -> PhoneResult<()> {
        self.ensure_known(AudioDirection::Input, device_id)?;
        device.set_input_device(device_id).await?;
        info!(device = %device_id, "Input device selected");
        self.state.selected_input = Some(device_id.to_string());
        Ok(())
    }

    /// Route call audio to `device_id`
    pub async fn set_output_device(&mut self, device: &dyn TelephonyDevice, device_id: &str) -> PhoneResult<()> {
        self.ensure_known(AudioDirection::Output, device_id)?;
        device.set_speaker_devices(&[device_id.to_string()]).await?;
        info!(device = %device_id, "Output device selected");
        self.state.selected_output = Some(device_id.to_string());
        Ok(())
    }

    /// Play the SDK test tone on the selected outputs
    pub async fn test_speaker(&self, device: &dyn TelephonyDevice) -> PhoneResult<()> {
        device.test_speaker().await
    }

    pub fn set_input_level(&mut self, level: f32) {
        self.state.input_level = level.clamp(0.0, 1.0);
    }

    pub fn set_output_level(&mut self, level: f32) {
        self.state.output_level = level.clamp(0.0, 1.0);
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.state.muted = muted;
    }

    /// Stop the capture stream, if one is open
    pub fn stop_capture(&mut self) {
        if let Some(control) = self.capture.take() {
            debug!("Stopping microphone capture");
            control.stop();
        }
    }

    /// Stop the level sampler and zero the meter
    pub fn stop_level_analysis(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        self.state.input_level = 0.0;
    }

    fn ensure_known(&self, direction: AudioDirection, device_id: &str) -> PhoneResult<()> {
        let list = match direction {
            AudioDirection::Input => &self.state.input_devices,
            AudioDirection::Output => &self.state.output_devices,
        };
        if list.iter().any(|d| d.id == device_id) {
            Ok(())
        } else {
            Err(PhoneError::media(format!("unknown {:?} device {}", direction, device_id)))
        }
    }
}

impl Drop for AudioDeviceMonitor {
    fn drop(&mut self) {
        self.stop_capture();
        self.stop_level_analysis();
    }
}

fn spawn_sampler<F>(mut frames: mpsc::Receiver<AudioFrame>, interval: Duration, on_level: F) -> JoinHandle<()>
where
    F: Fn(f32) + Send + 'static,
{
    tokio::spawn(async move {
        let mut meter = LevelMeter::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = 0.0f32;

        loop {
            ticker.tick().await;
            loop {
                match frames.try_recv() {
                    Ok(frame) => meter.push(frame_level(&frame.samples)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("Capture stream closed, level sampler exiting");
                        if last != 0.0 {
                            on_level(0.0);
                        }
                        return;
                    }
                }
            }

            let level = meter.average();
            if (level - last).abs() >= LEVEL_EPSILON {
                last = level;
                on_level(level);
            }
        }
    })
}
