//! Media plumbing shared by the session managers
//!
//! This module provides:
//! - The raw frame taxonomy (formats, buffer kinds, sizes, layouts)
//! - Canvases and the render/audio-output collaborators
//! - Exclusive bindings of capture devices and render surfaces
//! - The device capability interface

pub mod binding;
pub mod canvas;
pub mod device;
pub mod frame;

pub use binding::{Bindings, Rebind, RenderOwner};
pub use canvas::{AudioOutput, Canvas, MirrorMode, NullRenderer, SurfaceId, VideoRenderer, ViewMode};
pub use device::{
    AudioDeviceType, Capability, DeviceInfo, DeviceKind, DeviceProvider, NoDevices,
    RemoteDeviceState,
};
pub use frame::{AudioChannel, AudioFrame, Rect, Size, VideoBufferType, VideoFrame, VideoFrameFormat};
