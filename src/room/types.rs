//! Room membership value types

use serde::{Deserialize, Serialize};

/// Room connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RoomState {
    /// Not logged in, or logged out, or failed fatally
    #[default]
    Disconnected,
    /// Login requested or reconnecting after a network loss
    Connecting,
    /// Logged in, membership notifications flowing
    Connected,
}

/// A room member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub user_name: String,
}

impl User {
    /// User whose display name equals its id
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            user_name: user_id.clone(),
            user_id,
        }
    }

    pub fn with_name(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// A stream published in a room
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamInfo {
    pub user: User,
    pub stream_id: String,
    pub extra_info: String,
}

impl StreamInfo {
    pub fn new(user: User, stream_id: impl Into<String>) -> Self {
        Self {
            user,
            stream_id: stream_id.into(),
            extra_info: String::new(),
        }
    }

    pub fn with_extra_info(mut self, extra_info: impl Into<String>) -> Self {
        self.extra_info = extra_info.into();
        self
    }
}

/// Advanced room configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Maximum number of members, 0 = unlimited
    pub max_member_count: u32,
    /// Deliver user join/leave notifications
    pub is_user_status_notify: bool,
    /// Authentication token, empty = no authentication
    pub token: String,
}

impl RoomConfig {
    pub fn user_status_notify(mut self, enable: bool) -> Self {
        self.is_user_status_notify = enable;
        self
    }

    pub fn max_member_count(mut self, count: u32) -> Self {
        self.max_member_count = count;
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

/// Users and streams as pushed by the server on login or reconnect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub users: Vec<User>,
    pub streams: Vec<StreamInfo>,
}

/// Broadcast message received in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub message: String,
    pub message_id: u64,
    pub send_time_ms: u64,
    pub from_user: User,
}

/// Barrage message received in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrageMessage {
    pub message: String,
    pub message_id: String,
    pub send_time_ms: u64,
    pub from_user: User,
}
