//! Publish channel configuration
//!
//! Presets are plain functions from a preset enum to a value struct.

use serde::{Deserialize, Serialize};

use crate::media::{AudioChannel, Rect, Size};

/// One of the two independent publish slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublishChannel {
    Main,
    Aux,
}

impl PublishChannel {
    pub const ALL: [PublishChannel; 2] = [PublishChannel::Main, PublishChannel::Aux];

    pub fn index(&self) -> usize {
        match self {
            PublishChannel::Main => 0,
            PublishChannel::Aux => 1,
        }
    }
}

/// Publish state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PublisherState {
    #[default]
    NoPublish,
    PublishRequesting,
    Publishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoCodecId {
    #[default]
    Default,
    /// Layered codec, subscribers may pick base or extended layer
    MultiLayer,
    Vp8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioCodecId {
    #[default]
    Default,
    Normal,
    Normal2,
    Normal3,
    Low,
    Low2,
    Low3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoConfigPreset {
    Preset180P,
    Preset270P,
    Preset360P,
    Preset540P,
    Preset720P,
    Preset1080P,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioConfigPreset {
    BasicQuality,
    StandardQuality,
    StandardQualityStereo,
    HighQuality,
    HighQualityStereo,
}

/// Highest accepted encode frame rate
pub const MAX_FPS: u32 = 120;

/// Highest accepted video bitrate in kbps
pub const MAX_VIDEO_BITRATE: u32 = 100_000;

/// Highest accepted audio bitrate in kbps
pub const MAX_AUDIO_BITRATE: u32 = 512;

/// Video encode configuration of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    pub capture_resolution: Size,
    pub encode_resolution: Size,
    pub fps: u32,
    /// kbps
    pub bitrate: u32,
    pub codec_id: VideoCodecId,
}

impl VideoConfig {
    pub fn preset(preset: VideoConfigPreset) -> Self {
        let (size, bitrate) = match preset {
            VideoConfigPreset::Preset180P => (Size::new(180, 320), 300),
            VideoConfigPreset::Preset270P => (Size::new(270, 480), 400),
            VideoConfigPreset::Preset360P => (Size::new(360, 640), 600),
            VideoConfigPreset::Preset540P => (Size::new(540, 960), 1200),
            VideoConfigPreset::Preset720P => (Size::new(720, 1280), 1500),
            VideoConfigPreset::Preset1080P => (Size::new(1080, 1920), 3000),
        };

        Self {
            capture_resolution: size,
            encode_resolution: size,
            fps: 15,
            bitrate,
            codec_id: VideoCodecId::Default,
        }
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn bitrate(mut self, kbps: u32) -> Self {
        self.bitrate = kbps;
        self
    }

    pub fn codec(mut self, codec_id: VideoCodecId) -> Self {
        self.codec_id = codec_id;
        self
    }
}

impl Default for VideoConfig {
    /// 360p, 15 fps, 600 kbps
    fn default() -> Self {
        Self::preset(VideoConfigPreset::Preset360P)
    }
}

/// Audio encode configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// kbps
    pub bitrate: u32,
    pub channel: AudioChannel,
    pub codec_id: AudioCodecId,
}

impl AudioConfig {
    pub fn preset(preset: AudioConfigPreset) -> Self {
        let (bitrate, channel) = match preset {
            AudioConfigPreset::BasicQuality => (16, AudioChannel::Mono),
            AudioConfigPreset::StandardQuality => (48, AudioChannel::Mono),
            AudioConfigPreset::StandardQualityStereo => (56, AudioChannel::Stereo),
            AudioConfigPreset::HighQuality => (128, AudioChannel::Mono),
            AudioConfigPreset::HighQualityStereo => (192, AudioChannel::Stereo),
        };

        Self {
            bitrate,
            channel,
            codec_id: AudioCodecId::Default,
        }
    }
}

impl Default for AudioConfig {
    /// Standard quality: 48 kbps mono
    fn default() -> Self {
        Self::preset(AudioConfigPreset::StandardQuality)
    }
}

/// Traffic control property flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TrafficControlProperty(u32);

impl TrafficControlProperty {
    /// Bitrate adaptation only
    pub const BASIC: Self = Self(0);
    pub const ADAPTIVE_FPS: Self = Self(1);
    pub const ADAPTIVE_RESOLUTION: Self = Self(1 << 1);
    pub const ADAPTIVE_AUDIO_BITRATE: Self = Self(1 << 2);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TrafficControlProperty {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What happens to video when the budget drops below the minimum bitrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MinVideoBitrateMode {
    /// Stop sending video frames
    #[default]
    NoVideo,
    /// Keep sending video at no more than 2 fps
    UltraLowFps,
}

/// Traffic control policy of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficControlPolicy {
    pub enabled: bool,
    pub property: TrafficControlProperty,
    /// kbps, 0 = no floor
    pub min_video_bitrate: u32,
    pub min_video_bitrate_mode: MinVideoBitrateMode,
}

impl Default for TrafficControlPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            property: TrafficControlProperty::ADAPTIVE_FPS
                | TrafficControlProperty::ADAPTIVE_RESOLUTION,
            min_video_bitrate: 0,
            min_video_bitrate_mode: MinVideoBitrateMode::NoVideo,
        }
    }
}

/// Image overlay on a published or mixed stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub image_url: String,
    pub layout: Rect,
}

impl Watermark {
    pub fn new(image_url: impl Into<String>, layout: Rect) -> Self {
        Self {
            image_url: image_url.into(),
            layout,
        }
    }
}
