//! Rooms
//!
//! Membership, presence and reconnection for every joined room.

pub mod manager;
pub mod types;

pub use manager::{RoomManager, RoomSignal};
pub use types::{
    BarrageMessage, BroadcastMessage, RoomConfig, RoomSnapshot, RoomState, StreamInfo, User,
};
