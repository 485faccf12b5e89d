//! Event payloads delivered to the application

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::media::{AudioDeviceType, DeviceInfo, DeviceKind, RemoteDeviceState, Size};
use crate::media_player::{MediaPlayerHandle, MediaPlayerNetworkEvent, MediaPlayerState};
use crate::player::{PlayerMediaEvent, PlayerState};
use crate::publisher::{PublishChannel, PublisherState};
use crate::relay::RelayCdnInfo;
use crate::room::{BarrageMessage, BroadcastMessage, RoomState, StreamInfo, User};
use crate::stats::{PlayStreamQuality, PublishStreamQuality};

/// Opaque string-keyed values attached to state transitions
pub type ExtendedData = serde_json::Map<String, serde_json::Value>;

/// Direction of a membership delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateType {
    Add,
    Delete,
}

/// Callback stream an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    Room,
    Publisher,
    Player,
    Mixer,
    MediaPlayer,
    Device,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    StateUpdate {
        room_id: String,
        state: RoomState,
        error_code: i32,
        extended_data: ExtendedData,
    },
    UserUpdate {
        room_id: String,
        update_type: UpdateType,
        users: Vec<User>,
    },
    StreamUpdate {
        room_id: String,
        update_type: UpdateType,
        streams: Vec<StreamInfo>,
    },
    StreamExtraInfoUpdate {
        room_id: String,
        streams: Vec<StreamInfo>,
    },
    BroadcastMessage {
        room_id: String,
        messages: Vec<BroadcastMessage>,
    },
    BarrageMessage {
        room_id: String,
        messages: Vec<BarrageMessage>,
    },
    CustomCommand {
        room_id: String,
        command: String,
        from_user: User,
    },
}

impl RoomEvent {
    pub fn room_id(&self) -> &str {
        match self {
            RoomEvent::StateUpdate { room_id, .. }
            | RoomEvent::UserUpdate { room_id, .. }
            | RoomEvent::StreamUpdate { room_id, .. }
            | RoomEvent::StreamExtraInfoUpdate { room_id, .. }
            | RoomEvent::BroadcastMessage { room_id, .. }
            | RoomEvent::BarrageMessage { room_id, .. }
            | RoomEvent::CustomCommand { room_id, .. } => room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    StateUpdate {
        stream_id: String,
        channel: PublishChannel,
        state: PublisherState,
        error_code: i32,
        extended_data: ExtendedData,
    },
    QualityUpdate {
        stream_id: String,
        channel: PublishChannel,
        quality: PublishStreamQuality,
    },
    CapturedVideoFirstFrame {
        channel: PublishChannel,
    },
    CapturedAudioFirstFrame,
    VideoSizeChanged {
        size: Size,
        channel: PublishChannel,
    },
    /// Every relay of the stream, including the one that changed
    RelayCdnStateUpdate {
        stream_id: String,
        infos: Vec<RelayCdnInfo>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateUpdate {
        stream_id: String,
        state: PlayerState,
        error_code: i32,
        extended_data: ExtendedData,
    },
    QualityUpdate {
        stream_id: String,
        quality: PlayStreamQuality,
    },
    MediaEvent {
        stream_id: String,
        event: PlayerMediaEvent,
    },
    RecvAudioFirstFrame {
        stream_id: String,
    },
    RecvVideoFirstFrame {
        stream_id: String,
    },
    RenderVideoFirstFrame {
        stream_id: String,
    },
    VideoSizeChanged {
        stream_id: String,
        size: Size,
    },
    RecvSei {
        stream_id: String,
        data: Bytes,
    },
    RemoteCameraStateUpdate {
        stream_id: String,
        state: RemoteDeviceState,
    },
    RemoteMicStateUpdate {
        stream_id: String,
        state: RemoteDeviceState,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MixerEvent {
    RelayCdnStateUpdate {
        task_id: String,
        infos: Vec<RelayCdnInfo>,
    },
    /// Sound level per caller-supplied slot id, one map per report cycle
    SoundLevelUpdate {
        task_id: String,
        levels: HashMap<u32, f32>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaPlayerEvent {
    StateUpdate {
        player: MediaPlayerHandle,
        state: MediaPlayerState,
        error_code: i32,
    },
    NetworkEvent {
        player: MediaPlayerHandle,
        event: MediaPlayerNetworkEvent,
    },
    PlayingProgress {
        player: MediaPlayerHandle,
        millisecond: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Device failure; never changes a stream state by itself
    Error {
        error_code: i32,
        device_name: String,
    },
    AudioDeviceStateChanged {
        update_type: UpdateType,
        device_type: AudioDeviceType,
        device: DeviceInfo,
    },
    VideoDeviceStateChanged {
        update_type: UpdateType,
        device: DeviceInfo,
    },
    /// A local capture device was taken over by another channel
    CaptureDeviceDisplaced {
        kind: DeviceKind,
        device_id: String,
        channel: PublishChannel,
    },
}

/// Every notification the engine produces
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Room(RoomEvent),
    Publisher(PublisherEvent),
    Player(PlayerEvent),
    Mixer(MixerEvent),
    MediaPlayer(MediaPlayerEvent),
    Device(DeviceEvent),
}

impl EngineEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            EngineEvent::Room(_) => EventCategory::Room,
            EngineEvent::Publisher(_) => EventCategory::Publisher,
            EngineEvent::Player(_) => EventCategory::Player,
            EngineEvent::Mixer(_) => EventCategory::Mixer,
            EngineEvent::MediaPlayer(_) => EventCategory::MediaPlayer,
            EngineEvent::Device(_) => EventCategory::Device,
        }
    }
}

impl From<RoomEvent> for EngineEvent {
    fn from(event: RoomEvent) -> Self {
        EngineEvent::Room(event)
    }
}

impl From<PublisherEvent> for EngineEvent {
    fn from(event: PublisherEvent) -> Self {
        EngineEvent::Publisher(event)
    }
}

impl From<PlayerEvent> for EngineEvent {
    fn from(event: PlayerEvent) -> Self {
        EngineEvent::Player(event)
    }
}

impl From<MixerEvent> for EngineEvent {
    fn from(event: MixerEvent) -> Self {
        EngineEvent::Mixer(event)
    }
}

impl From<MediaPlayerEvent> for EngineEvent {
    fn from(event: MediaPlayerEvent) -> Self {
        EngineEvent::MediaPlayer(event)
    }
}

impl From<DeviceEvent> for EngineEvent {
    fn from(event: DeviceEvent) -> Self {
        EngineEvent::Device(event)
    }
}
