//! Remote stream playback

pub mod manager;
pub mod types;

pub use manager::PlayerManager;
pub use types::{PlayRoute, PlayerConfig, PlayerMediaEvent, PlayerState, PlayerVideoLayer};
