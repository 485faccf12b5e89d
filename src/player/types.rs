//! Play stream value types

use serde::{Deserialize, Serialize};

use crate::relay::CdnConfig;

/// Play state of a remote stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlayerState {
    #[default]
    NoPlay,
    PlayRequesting,
    Playing,
}

/// Which layer of a layered stream to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlayerVideoLayer {
    /// Chosen from network conditions
    #[default]
    Auto,
    /// Small resolution
    Base,
    /// Big resolution
    BaseExtend,
}

/// Media stall events while playing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerMediaEvent {
    AudioBreakOccur,
    AudioBreakResume,
    VideoBreakOccur,
    VideoBreakResume,
}

/// Advanced play configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Pull from this CDN URL instead of the cloud route; the stream id then
    /// only correlates callbacks
    pub cdn_config: Option<CdnConfig>,
    pub video_layer: PlayerVideoLayer,
}

impl PlayerConfig {
    pub fn cdn(mut self, config: CdnConfig) -> Self {
        self.cdn_config = Some(config);
        self
    }

    pub fn video_layer(mut self, layer: PlayerVideoLayer) -> Self {
        self.video_layer = layer;
        self
    }
}

/// How a play request is routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayRoute {
    /// Cloud-routed by stream id
    Cloud { stream_id: String },
    /// Pulled directly from a CDN
    Cdn(CdnConfig),
}
