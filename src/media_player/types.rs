//! Media player value types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index into the player arena plus the generation of the slot when the
/// player was created. A handle outlives its player but never resolves to a
/// later player in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaPlayerHandle {
    pub index: usize,
    pub generation: u64,
}

impl fmt::Display for MediaPlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MediaPlayerState {
    #[default]
    NoPlay,
    Playing,
    Pausing,
    /// Resource exhausted with repeat off
    PlayEnded,
}

/// Buffering of a network resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaPlayerNetworkEvent {
    BufferBegin,
    BufferEnded,
}
