//! Media resource collaborators
//!
//! The engine never decodes anything itself. A [`MediaSource`] opens a path
//! or URL into a [`MediaResource`], which the player clock reads one time
//! window at a time.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::media::{AudioFrame, VideoBufferType, VideoFrame, VideoFrameFormat};

use super::types::MediaPlayerHandle;

/// Decoded media unit
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

/// Result of reading a time window
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// Frames whose timestamps fall in the window, in presentation order
    Frames(Vec<MediaFrame>),
    /// Not enough data yet; the clock does not advance
    Buffering,
}

/// An opened resource
pub trait MediaResource: Send + 'static {
    fn duration_ms(&self) -> u64;

    /// Decoded frames for `[from_ms, to_ms)`
    fn read(&mut self, from_ms: u64, to_ms: u64) -> ReadOutcome;

    /// Ask the decoder for this video layout from now on
    fn set_video_format(&mut self, _format: VideoFrameFormat, _buffer_type: VideoBufferType) {}
}

/// Opens resources by local path or network URL
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    async fn open(&self, path: &str) -> Result<Box<dyn MediaResource>>;
}

/// Source used when the host registers none
#[derive(Debug, Default)]
pub struct NoMediaSource;

#[async_trait]
impl MediaSource for NoMediaSource {
    async fn open(&self, path: &str) -> Result<Box<dyn MediaResource>> {
        Err(Error::LoadFailed(format!("no media source for {}", path)))
    }
}

/// Receives decoded video of a player, in addition to local rendering
pub trait MediaPlayerVideoHandler: Send + Sync + 'static {
    fn on_video_frame(&self, player: MediaPlayerHandle, frame: &VideoFrame);
}

/// Receives decoded audio of a player, in addition to local playout
pub trait MediaPlayerAudioHandler: Send + Sync + 'static {
    fn on_audio_frame(&self, player: MediaPlayerHandle, frame: &AudioFrame);
}

pub type VideoHandlerRef = Arc<dyn MediaPlayerVideoHandler>;
pub type AudioHandlerRef = Arc<dyn MediaPlayerAudioHandler>;
