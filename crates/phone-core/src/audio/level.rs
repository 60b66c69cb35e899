//! Input level analysis
//!
//! The level shown next to the microphone selector is the mean absolute
//! amplitude of each captured frame, normalized to `[0, 1]`, averaged over a
//! short window of recent frames so the meter does not flicker.

use std::collections::VecDeque;

/// Number of frames averaged by [`LevelMeter`] (about 100ms at 20ms frames)
pub const DEFAULT_LEVEL_WINDOW: usize = 5;

/// Normalized level of one block of samples
pub fn frame_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: u64 = samples.iter().map(|s| s.unsigned_abs() as u64).sum();
    let mean = sum as f32 / samples.len() as f32;
    (mean / i16::MAX as f32).clamp(0.0, 1.0)
}

/// Sliding average over the most recent frame levels
#[derive(Debug, Clone)]
pub struct LevelMeter {
    window: VecDeque<f32>,
    capacity: usize,
}

impl LevelMeter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, level: f32) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(level.clamp(0.0, 1.0));
    }

    pub fn average(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        assert_eq!(frame_level(&[0; 160]), 0.0);
        assert_eq!(frame_level(&[]), 0.0);
    }

    #[test]
    fn test_full_scale_is_one() {
        assert!((frame_level(&[i16::MAX; 160]) - 1.0).abs() < f32::EPSILON);
        // i16::MIN has a larger magnitude than MAX; still clamps to 1
        assert_eq!(frame_level(&[i16::MIN; 160]), 1.0);
    }

    #[test]
    fn test_level_ignores_sign() {
        let level = frame_level(&[16384, -16384, 16384, -16384]);
        assert!((level - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_meter_averages_window() {
        let mut meter = LevelMeter::new(2);
        meter.push(1.0);
        meter.push(0.0);
        assert!((meter.average() - 0.5).abs() < f32::EPSILON);

        // oldest sample falls out
        meter.push(0.0);
        assert_eq!(meter.average(), 0.0);

        meter.reset();
        assert_eq!(meter.average(), 0.0);
    }
}
