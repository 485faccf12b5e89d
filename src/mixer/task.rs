//! Mixer task configuration
//!
//! A task is a plain configuration object until it is started. The task id is
//! fixed at construction.

use serde::{Deserialize, Serialize};

use crate::media::{AudioChannel, Rect, Size};
use crate::publisher::{AudioCodecId, Watermark};

/// Audio encode settings of the mixed output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerAudioConfig {
    /// kbps, frozen once the task starts
    pub bitrate: u32,
    pub channel: AudioChannel,
    pub codec_id: AudioCodecId,
}

impl Default for MixerAudioConfig {
    fn default() -> Self {
        Self {
            bitrate: 48,
            channel: AudioChannel::Mono,
            codec_id: AudioCodecId::Default,
        }
    }
}

/// Video encode settings of the mixed output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerVideoConfig {
    /// Output canvas
    pub resolution: Size,
    /// Frozen once the task starts
    pub fps: u32,
    /// kbps, frozen once the task starts
    pub bitrate: u32,
}

impl MixerVideoConfig {
    pub fn new(resolution: Size, fps: u32, bitrate: u32) -> Self {
        Self {
            resolution,
            fps,
            bitrate,
        }
    }
}

impl Default for MixerVideoConfig {
    fn default() -> Self {
        Self::new(Size::new(360, 640), 15, 600)
    }
}

/// What an input contributes to the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MixerInputContentType {
    Audio,
    Video,
}

/// One composited input stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerInput {
    pub stream_id: String,
    pub content_type: MixerInputContentType,
    pub layout: Rect,
    /// Slot used to tag this input in sound level reports
    pub sound_level_id: Option<u32>,
}

impl MixerInput {
    pub fn new(stream_id: impl Into<String>, content_type: MixerInputContentType, layout: Rect) -> Self {
        Self {
            stream_id: stream_id.into(),
            content_type,
            layout,
            sound_level_id: None,
        }
    }

    pub fn with_sound_level_id(mut self, id: u32) -> Self {
        self.sound_level_id = Some(id);
        self
    }
}

/// Where the mix goes: a CDN URL or a stream id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MixerOutput {
    pub target: String,
}

impl MixerOutput {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

/// Server-side compositing job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerTask {
    task_id: String,
    pub inputs: Vec<MixerInput>,
    pub outputs: Vec<MixerOutput>,
    pub audio_config: MixerAudioConfig,
    pub video_config: MixerVideoConfig,
    pub watermark: Option<Watermark>,
    pub background_image_url: Option<String>,
    pub sound_level: bool,
}

impl MixerTask {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            audio_config: MixerAudioConfig::default(),
            video_config: MixerVideoConfig::default(),
            watermark: None,
            background_image_url: None,
            sound_level: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn set_audio_config(&mut self, config: MixerAudioConfig) -> &mut Self {
        self.audio_config = config;
        self
    }

    pub fn set_video_config(&mut self, config: MixerVideoConfig) -> &mut Self {
        self.video_config = config;
        self
    }

    pub fn set_input_list(&mut self, inputs: Vec<MixerInput>) -> &mut Self {
        self.inputs = inputs;
        self
    }

    pub fn set_output_list(&mut self, outputs: Vec<MixerOutput>) -> &mut Self {
        self.outputs = outputs;
        self
    }

    pub fn set_watermark(&mut self, watermark: Watermark) -> &mut Self {
        self.watermark = Some(watermark);
        self
    }

    pub fn set_background_image_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.background_image_url = Some(url.into());
        self
    }

    pub fn enable_sound_level(&mut self, enable: bool) -> &mut Self {
        self.sound_level = enable;
        self
    }
}
