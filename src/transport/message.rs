//! Messages exchanged with the transport collaborator

use bytes::Bytes;

use crate::event::UpdateType;
use crate::media::{AudioFrame, DeviceKind, RemoteDeviceState, Size, VideoFrame};
use crate::mixer::MixerTask;
use crate::player::{PlayRoute, PlayerMediaEvent, PlayerVideoLayer};
use crate::publisher::{PublishChannel, Watermark};
use crate::relay::{CdnConfig, RelayCdnState, RelayUpdateReason};
use crate::room::{BarrageMessage, BroadcastMessage, RoomSnapshot, StreamInfo, User};
use crate::stats::{DownlinkSample, NetworkSample};

use super::TransportErrorKind;

/// Outbound control request
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Login {
        room_id: String,
        user: User,
        token: String,
        max_member_count: u32,
        user_status_notify: bool,
    },
    Logout {
        room_id: String,
    },
    StartPublish {
        room_id: String,
        stream_id: String,
        channel: PublishChannel,
        extra_info: String,
        direct_cdn: Option<CdnConfig>,
    },
    StopPublish {
        room_id: String,
        stream_id: String,
    },
    SetStreamExtraInfo {
        room_id: String,
        stream_id: String,
        extra_info: String,
    },
    SetWatermark {
        stream_id: String,
        watermark: Option<Watermark>,
    },
    UpdateDeviceState {
        stream_id: String,
        device: DeviceKind,
        state: RemoteDeviceState,
    },
    StartPlay {
        room_id: Option<String>,
        stream_id: String,
        route: PlayRoute,
        video_layer: PlayerVideoLayer,
    },
    StopPlay {
        stream_id: String,
    },
    SetVideoLayer {
        stream_id: String,
        layer: PlayerVideoLayer,
    },
    AddRelay {
        stream_id: String,
        target: CdnConfig,
    },
    RemoveRelay {
        stream_id: String,
        url: String,
    },
    StartMixer(MixerTask),
    UpdateMixer(MixerTask),
    StopMixer {
        task_id: String,
    },
}

impl ControlMessage {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Login { .. } => "login",
            ControlMessage::Logout { .. } => "logout",
            ControlMessage::StartPublish { .. } => "start_publish",
            ControlMessage::StopPublish { .. } => "stop_publish",
            ControlMessage::SetStreamExtraInfo { .. } => "set_stream_extra_info",
            ControlMessage::SetWatermark { .. } => "set_watermark",
            ControlMessage::UpdateDeviceState { .. } => "update_device_state",
            ControlMessage::StartPlay { .. } => "start_play",
            ControlMessage::StopPlay { .. } => "stop_play",
            ControlMessage::SetVideoLayer { .. } => "set_video_layer",
            ControlMessage::AddRelay { .. } => "add_relay",
            ControlMessage::RemoveRelay { .. } => "remove_relay",
            ControlMessage::StartMixer(_) => "start_mixer",
            ControlMessage::UpdateMixer(_) => "update_mixer",
            ControlMessage::StopMixer { .. } => "stop_mixer",
        }
    }
}

/// Successful reply to a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Ack,
    /// Login accepted with the current membership
    LoggedIn(RoomSnapshot),
    /// Play accepted; `layered` when the publisher encodes a layered codec
    PlayAccepted { layered: bool },
}

/// Server-initiated notification
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPush {
    UserUpdate {
        room_id: String,
        update: UpdateType,
        users: Vec<User>,
    },
    StreamUpdate {
        room_id: String,
        update: UpdateType,
        streams: Vec<StreamInfo>,
    },
    StreamExtraInfoUpdate {
        room_id: String,
        streams: Vec<StreamInfo>,
    },
    /// Session terminated by the server (duplicate login, token expired)
    KickedOut {
        room_id: String,
        reason: TransportErrorKind,
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
    UplinkStats {
        channel: PublishChannel,
        sample: NetworkSample,
    },
    DownlinkStats {
        stream_id: String,
        sample: DownlinkSample,
    },
    /// Publish dropped by the server while publishing
    PublishInterrupted {
        stream_id: String,
        reason: TransportErrorKind,
    },
    /// Play dropped by the server while playing
    PlayInterrupted {
        stream_id: String,
        reason: TransportErrorKind,
    },
    RelayStateChanged {
        stream_id: String,
        url: String,
        state: RelayCdnState,
        reason: RelayUpdateReason,
    },
    MixerRelayStateChanged {
        task_id: String,
        url: String,
        state: RelayCdnState,
        reason: RelayUpdateReason,
    },
    /// Per-input sound levels keyed by input stream id
    MixerSoundLevels {
        task_id: String,
        levels: Vec<(String, f32)>,
    },
    PlayerMediaEvent {
        stream_id: String,
        event: PlayerMediaEvent,
    },
    PlayerSei {
        stream_id: String,
        data: Bytes,
    },
    RemoteDeviceState {
        stream_id: String,
        device: DeviceKind,
        state: RemoteDeviceState,
    },
}

/// Network reachability reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Lost,
}

/// Encoder parameters chosen by traffic control for a video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoEncodeParams {
    pub resolution: Size,
    pub fps: u32,
    /// kbps
    pub bitrate: u32,
    pub mirror: bool,
}

/// Outbound media unit handed to the transport
#[derive(Debug, Clone)]
pub enum MediaPacket {
    /// Video frame with the SEI payloads attached to it, in send order
    Video {
        frame: VideoFrame,
        params: VideoEncodeParams,
        sei: Vec<Bytes>,
    },
    Audio {
        frame: AudioFrame,
        /// kbps
        bitrate: u32,
        /// Capture gain the encoder applies, 0 ~ 100
        volume: u8,
    },
    /// Media player audio mixed into the channel's audio
    AuxAudio { frame: AudioFrame },
}
