//! Local media players
//!
//! A bounded pool of players, each playing one file or network resource and
//! optionally mixing its audio into the main publish channel.

mod pool;

pub mod manager;
pub mod source;
pub mod types;

pub use manager::MediaPlayerManager;
pub use source::{
    AudioHandlerRef, MediaFrame, MediaPlayerAudioHandler, MediaPlayerVideoHandler, MediaResource,
    MediaSource, NoMediaSource, ReadOutcome, VideoHandlerRef,
};
pub use types::{MediaPlayerHandle, MediaPlayerNetworkEvent, MediaPlayerState};
