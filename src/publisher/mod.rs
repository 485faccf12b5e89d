//! Stream publishing
//!
//! Two publish channels, each with its own encoder configuration, traffic
//! control, relays and preview. See [`PublisherManager`] for the state
//! machine.

mod channel;
pub mod config;
pub mod manager;
pub mod traffic;

pub use config::{
    AudioCodecId, AudioConfig, AudioConfigPreset, MinVideoBitrateMode, PublishChannel,
    PublisherState, TrafficControlPolicy, TrafficControlProperty, VideoCodecId, VideoConfig,
    VideoConfigPreset, Watermark, MAX_AUDIO_BITRATE, MAX_FPS, MAX_VIDEO_BITRATE,
};
pub use manager::{AuxAudioSink, PublisherManager};
pub use traffic::{EncodeDecision, TrafficGovernor};
