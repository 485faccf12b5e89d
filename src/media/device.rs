//! Device capability interface
//!
//! Device enumeration is platform specific and lives outside the engine. The
//! engine only asks a [`DeviceProvider`] and forwards its notifications.

use serde::{Deserialize, Serialize};

/// Result of a platform capability query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability<T> {
    Supported(T),
    Unsupported,
}

impl<T> Capability<T> {
    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported(_))
    }

    pub fn supported(self) -> Option<T> {
        match self {
            Capability::Supported(value) => Some(value),
            Capability::Unsupported => None,
        }
    }
}

/// A capture or playout device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
        }
    }
}

/// Direction of an audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioDeviceType {
    Input,
    Output,
}

/// Which device of a remote publisher a state refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Camera,
    Microphone,
}

/// State of a remote publisher's device as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteDeviceState {
    Open,
    GenericError,
    InvalidId,
    NoAuthorization,
    ZeroFps,
    InUseByOther,
    Unplugged,
    RebootRequired,
    SystemMediaServicesLost,
    Disable,
    Mute,
    Interruption,
    InBackground,
    MultiForegroundApp,
    BySystemPressure,
}

/// Platform device enumeration
pub trait DeviceProvider: Send + Sync + 'static {
    fn audio_devices(&self, device_type: AudioDeviceType) -> Capability<Vec<DeviceInfo>>;

    fn video_devices(&self) -> Capability<Vec<DeviceInfo>>;
}

/// Provider for platforms without device enumeration
#[derive(Debug, Default)]
pub struct NoDevices;

impl DeviceProvider for NoDevices {
    fn audio_devices(&self, _device_type: AudioDeviceType) -> Capability<Vec<DeviceInfo>> {
        Capability::Unsupported
    }

    fn video_devices(&self) -> Capability<Vec<DeviceInfo>> {
        Capability::Unsupported
    }
}
