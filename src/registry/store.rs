//! Session registry implementation
//!
//! Process-wide index of joined rooms, publish claims and play streams. The
//! managers own the entity state machines; the registry is what lets one
//! manager find out about another manager's entities (which room to publish
//! into, which channel a relay push belongs to, which streams a closing room
//! takes down).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::publisher::PublishChannel;
use crate::room::RoomState;

use super::error::RegistryError;

/// A publish channel's hold on a stream id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishClaim {
    pub channel: PublishChannel,
    pub room_id: String,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Joined rooms in join order
    rooms: Vec<(String, RoomState)>,

    /// Stream id to publishing channel
    publishers: HashMap<String, PublishClaim>,

    /// Play stream id to the room it was requested through (None = CDN pull)
    players: HashMap<String, Option<String>>,
}

/// Central index shared by every manager
///
/// Thread-safe via `RwLock`. Lookups from the push router and the capture
/// path only take the read lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a room, or update its state if already tracked
    pub fn set_room_state(&self, room_id: &str, state: RoomState) {
        let mut inner = self.inner.write();
        match inner.rooms.iter_mut().find(|(id, _)| id == room_id) {
            Some(entry) => entry.1 = state,
            None => inner.rooms.push((room_id.to_string(), state)),
        }
    }

    pub fn remove_room(&self, room_id: &str) {
        let mut inner = self.inner.write();
        inner.rooms.retain(|(id, _)| id != room_id);
        tracing::debug!(room = %room_id, remaining = inner.rooms.len(), "Room removed from registry");
    }

    pub fn room_state(&self, room_id: &str) -> RoomState {
        self.inner
            .read()
            .rooms
            .iter()
            .find(|(id, _)| id == room_id)
            .map(|(_, state)| *state)
            .unwrap_or_default()
    }

    /// Earliest joined room that is not disconnected
    pub fn first_active_room(&self) -> Option<String> {
        self.inner
            .read()
            .rooms
            .iter()
            .find(|(_, state)| *state != RoomState::Disconnected)
            .map(|(id, _)| id.clone())
    }

    /// Claim a stream id for a channel
    ///
    /// Claiming an id the same channel already holds succeeds. Returns an
    /// error if another channel holds it.
    pub fn claim_stream(
        &self,
        stream_id: &str,
        channel: PublishChannel,
        room_id: &str,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();

        if let Some(claim) = inner.publishers.get(stream_id) {
            if claim.channel != channel {
                return Err(RegistryError::StreamIdInUse(stream_id.to_string()));
            }
        }

        inner.publishers.insert(
            stream_id.to_string(),
            PublishClaim {
                channel,
                room_id: room_id.to_string(),
            },
        );

        tracing::info!(stream = %stream_id, channel = ?channel, room = %room_id, "Stream id claimed");
        Ok(())
    }

    /// Release a claim held by `channel`
    pub fn release_stream(&self, stream_id: &str, channel: PublishChannel) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();

        match inner.publishers.get(stream_id) {
            Some(claim) if claim.channel == channel => {
                inner.publishers.remove(stream_id);
                tracing::debug!(stream = %stream_id, channel = ?channel, "Stream id released");
                Ok(())
            }
            _ => {
                tracing::warn!(stream = %stream_id, channel = ?channel, "Stream id release mismatch");
                Err(RegistryError::ClaimMismatch(stream_id.to_string()))
            }
        }
    }

    pub fn channel_of(&self, stream_id: &str) -> Option<PublishChannel> {
        self.inner.read().publishers.get(stream_id).map(|c| c.channel)
    }

    pub fn register_play(&self, stream_id: &str, room_id: Option<&str>) {
        self.inner
            .write()
            .players
            .insert(stream_id.to_string(), room_id.map(str::to_string));
    }

    pub fn unregister_play(&self, stream_id: &str) -> bool {
        self.inner.write().players.remove(stream_id).is_some()
    }

    pub fn is_playing(&self, stream_id: &str) -> bool {
        self.inner.read().players.contains_key(stream_id)
    }
}
