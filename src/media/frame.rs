//! Raw frame taxonomy shared by capture, render and the media player
//!
//! Frames are opaque to the session engine. The payload is a `bytes::Bytes`
//! so fan-out to several sinks (local render, handler callbacks, transport)
//! only bumps a reference count.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel layout of a raw video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoFrameFormat {
    /// Platform default
    #[default]
    Unknown,
    I420,
    Nv12,
    Nv21,
    Bgra32,
    Rgba32,
    Argb32,
    Abgr32,
    I422,
}

impl VideoFrameFormat {
    /// Whether the format belongs to the YUV family
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            VideoFrameFormat::I420
                | VideoFrameFormat::Nv12
                | VideoFrameFormat::Nv21
                | VideoFrameFormat::I422
        )
    }

    /// Number of planes carried in the frame
    pub fn plane_count(&self) -> usize {
        match self {
            VideoFrameFormat::I420 | VideoFrameFormat::I422 => 3,
            VideoFrameFormat::Nv12 | VideoFrameFormat::Nv21 => 2,
            _ => 1,
        }
    }
}

/// Where the frame's pixels live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoBufferType {
    /// Plain memory buffer
    #[default]
    RawData,
    /// GPU texture handle
    GpuTexture,
    /// Platform native pixel buffer
    PlatformNative,
}

/// Audio channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioChannel {
    #[default]
    Mono,
    Stereo,
}

impl AudioChannel {
    pub fn count(&self) -> u16 {
        match self {
            AudioChannel::Mono => 1,
            AudioChannel::Stereo => 2,
        }
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Scale both dimensions, rounding down to even values as encoders expect
    pub fn scaled(&self, factor: f64) -> Size {
        let even = |v: u32| ((v as f64 * factor) as u32) & !1;
        Size::new(even(self.width).max(2), even(self.height).max(2))
    }
}

/// Axis-aligned rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the rectangle lies entirely inside a canvas of `bounds`
    pub fn fits_within(&self, bounds: Size) -> bool {
        if self.x < 0 || self.y < 0 {
            return false;
        }
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        right <= bounds.width as u64 && bottom <= bounds.height as u64
    }
}

/// A raw video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub format: VideoFrameFormat,
    pub buffer_type: VideoBufferType,
    pub size: Size,
    /// Bytes per row for each plane
    pub strides: Vec<u32>,
    /// Presentation timestamp in milliseconds
    pub timestamp_ms: u64,
    pub data: Bytes,
}

impl VideoFrame {
    pub fn new(format: VideoFrameFormat, size: Size, timestamp_ms: u64, data: Bytes) -> Self {
        Self {
            format,
            buffer_type: VideoBufferType::RawData,
            size,
            strides: Vec::new(),
            timestamp_ms,
            data,
        }
    }
}

/// A raw PCM audio frame
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channel: AudioChannel,
    /// Presentation timestamp in milliseconds
    pub timestamp_ms: u64,
    pub data: Bytes,
}

impl AudioFrame {
    pub fn new(sample_rate: u32, channel: AudioChannel, timestamp_ms: u64, data: Bytes) -> Self {
        Self {
            sample_rate,
            channel,
            timestamp_ms,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_fits_within() {
        let canvas = Size::new(640, 360);
        assert!(Rect::new(0, 0, 640, 360).fits_within(canvas));
        assert!(Rect::new(320, 180, 320, 180).fits_within(canvas));
        assert!(!Rect::new(321, 180, 320, 180).fits_within(canvas));
        assert!(!Rect::new(-1, 0, 10, 10).fits_within(canvas));
    }

    #[test]
    fn test_size_scaled_is_even() {
        let size = Size::new(360, 640).scaled(0.75);
        assert_eq!(size, Size::new(270, 480));
        let odd = Size::new(270, 480).scaled(0.5);
        assert_eq!(odd.width % 2, 0);
    }

    #[test]
    fn test_format_planes() {
        assert_eq!(VideoFrameFormat::I420.plane_count(), 3);
        assert_eq!(VideoFrameFormat::Nv21.plane_count(), 2);
        assert!(!VideoFrameFormat::Bgra32.is_yuv());
    }
}
