//! Audio device descriptors and captured frames

use serde::{Deserialize, Serialize};

/// Audio device direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioDirection {
    /// Audio input (microphone)
    Input,
    /// Audio output (speaker)
    Output,
}

/// Audio device information as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    /// Platform device identifier
    pub id: String,
    /// Human-readable label (may be empty until permission is granted)
    pub label: String,
    pub direction: AudioDirection,
    /// Whether the platform marks this as the default device
    pub is_default: bool,
}

impl AudioDeviceInfo {
    pub fn new(id: impl Into<String>, label: impl Into<String>, direction: AudioDirection) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            direction,
            is_default: false,
        }
    }

    pub fn input(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(id, label, AudioDirection::Input)
    }

    pub fn output(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(id, label, AudioDirection::Output)
    }

    /// Mark as the platform default
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// A block of captured PCM audio
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Audio samples as i16 PCM, mono
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Capture timestamp in milliseconds since the stream opened
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, timestamp_ms: u64) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp_ms,
        }
    }

    /// A frame of `duration_ms` filled with a constant amplitude
    pub fn constant(amplitude: i16, sample_rate: u32, duration_ms: u32, timestamp_ms: u64) -> Self {
        let count = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
        Self::new(vec![amplitude; count], sample_rate, timestamp_ms)
    }
}
