//! Audio Device Monitor
//!
//! Tracks what the agent's audio setup looks like: whether the microphone may
//! be used, which inputs and outputs exist, which ones are selected, and how
//! loud the microphone currently is.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐    ┌─────────────────────┐    ┌─────────────────────┐
//! │   SessionManager    │    │ AudioDeviceMonitor  │    │   MediaBackend      │
//! │                     │    │                     │    │                     │
//! │ select_input()      │───▶│ AudioState          │───▶│ request_microphone  │
//! │ select_output()     │    │ device selection    │    │ enumerate_devices   │
//! │ refresh_devices()   │    │ level sampler       │    │ device_changes      │
//! └─────────────────────┘    └─────────────────────┘    └─────────────────────┘
//!                                      │
//!                                      ▼
//!                            ┌─────────────────────┐
//!                            │  TelephonyDevice    │
//!                            │ set_input_device    │
//!                            │ set_speaker_devices │
//!                            └─────────────────────┘
//! ```
//!
//! Device routing for the call itself always goes through the telephony SDK;
//! the platform backend is only used for permission, inventory and metering.
//!
//! Failure semantics: a permission denial is terminal until the user retries,
//! enumeration and selection failures are logged and never affect the call.

pub mod backend;
pub mod device;
pub mod level;
pub mod mock;
pub mod monitor;

pub use backend::{CaptureControl, CaptureStream, MediaBackend};
pub use device::{AudioDeviceInfo, AudioDirection, AudioFrame};
pub use level::{frame_level, LevelMeter};
pub use mock::MockMediaBackend;
pub use monitor::{AudioDeviceMonitor, AudioState};
