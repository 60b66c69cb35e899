//! Telephony SDK seam
//!
//! The soft-phone SDK is an external collaborator. The session manager only
//! sees it through three traits:
//!
//! - [`TelephonyConnector`] builds a device bound to an access token
//! - [`TelephonyDevice`] is the registered endpoint (register, token update, audio routing, dial)
//! - [`TelephonyCall`] is one call object (accept, reject, disconnect, mute, quality)
//!
//! Events flow the other way through unbounded channels handed out with the
//! device ([`DeviceHandle`]) and with every call ([`CallHandle`]).
//!
//! [`mock`] contains the simulated SDK used by the test-suite and the CLI.

pub mod mock;

pub use mock::{MockCall, MockDevice, MockTelephony};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::AcceptConstraints;
use crate::error::PhoneResult;

/// Options fixed at device construction time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Whether the SDK may deliver a second incoming call while one is live.
    /// The session manager never supports call waiting, so this is `false`.
    pub allow_incoming_while_busy: bool,
    /// Codec preference order handed to the SDK
    pub codec_preferences: Vec<String>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            allow_incoming_while_busy: false,
            codec_preferences: vec!["opus".to_string(), "pcmu".to_string()],
        }
    }
}

/// Events emitted by a telephony device
#[derive(Debug)]
pub enum DeviceEvent {
    Registered,
    /// The endpoint lost its registration (network loss, server side expiry)
    Unregistered,
    Error { message: String },
    Incoming(CallHandle),
    /// The access token is about to expire
    TokenWillExpire,
    /// The SDK's audio subsystem saw devices come or go
    AudioDevicesChanged,
}

/// Events emitted by a call object
#[derive(Debug, Clone, PartialEq)]
pub enum CallObjectEvent {
    /// Media is flowing (answered locally or by the remote party on outbound calls)
    Accepted,
    Disconnected,
    /// The caller hung up before the call was answered
    Cancelled,
    Error { message: String },
    /// Input and output volume, both in `[0, 1]`
    Volume { input: f32, output: f32 },
    /// Quality warning raised by the SDK (e.g. `high-jitter`, `low-mos`)
    Warning(String),
    WarningCleared(String),
}

/// Call quality measurements reported by the SDK
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallQualityMetrics {
    /// Mean Opinion Score (1.0-5.0), higher is better
    pub mos_score: Option<f32>,
    pub jitter_ms: Option<u32>,
    pub packet_loss_percent: Option<f32>,
    pub round_trip_time_ms: Option<u32>,
}

/// A telephony call object
#[async_trait]
pub trait TelephonyCall: Send + Sync + fmt::Debug {
    /// Caller identity (phone number or client name)
    fn remote_identity(&self) -> String;

    async fn accept(&self, constraints: &AcceptConstraints) -> PhoneResult<()>;

    async fn reject(&self) -> PhoneResult<()>;

    async fn disconnect(&self) -> PhoneResult<()>;

    async fn mute(&self, muted: bool) -> PhoneResult<()>;

    /// Latest quality sample, if the SDK has one
    async fn quality_metrics(&self) -> Option<CallQualityMetrics>;
}

/// A telephony device (registered soft-phone endpoint)
#[async_trait]
pub trait TelephonyDevice: Send + Sync + fmt::Debug {
    async fn register(&self) -> PhoneResult<()>;

    async fn unregister(&self) -> PhoneResult<()>;

    async fn update_token(&self, token: &str) -> PhoneResult<()>;

    /// Release every SDK resource held by this device
    async fn destroy(&self);

    /// Place an outbound call
    async fn connect(&self, to: &str) -> PhoneResult<CallHandle>;

    async fn set_input_device(&self, device_id: &str) -> PhoneResult<()>;

    async fn set_speaker_devices(&self, device_ids: &[String]) -> PhoneResult<()>;

    /// Play the SDK's speaker test tone on the selected outputs
    async fn test_speaker(&self) -> PhoneResult<()>;
}

/// Factory for telephony devices
#[async_trait]
pub trait TelephonyConnector: Send + Sync {
    async fn create_device(&self, token: &str, options: &DeviceOptions) -> PhoneResult<DeviceHandle>;
}

/// A freshly constructed device and its event stream
pub struct DeviceHandle {
    pub device: Arc<dyn TelephonyDevice>,
    pub events: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle").field("device", &self.device).finish()
    }
}

/// A call object and its event stream
pub struct CallHandle {
    pub call: Arc<dyn TelephonyCall>,
    pub events: mpsc::UnboundedReceiver<CallObjectEvent>,
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle").field("call", &self.call).finish()
    }
}
