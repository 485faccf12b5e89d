//! Per-channel publish state
//!
//! Everything a channel carries between calls. Configuration survives
//! stop/start; the session part (stream id, relays, counters, tasks) is reset
//! whenever the channel returns to `NoPublish`.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::event::{ExtendedData, PublisherEvent};
use crate::media::{Canvas, MirrorMode, Size};
use crate::relay::{CdnConfig, RelayTable};
use crate::stats::{NetworkSample, PublishCounters};

use super::config::{
    AudioConfig, PublishChannel, PublisherState, TrafficControlPolicy, VideoConfig, Watermark,
};
use super::traffic::TrafficGovernor;

pub(crate) struct ChannelState {
    pub channel: PublishChannel,

    /// Stream being published, None in `NoPublish`
    pub stream_id: Option<String>,

    /// Room the stream is published into
    pub room_id: Option<String>,

    pub state: PublisherState,

    /// Bumped on every start, stop and interruption
    pub generation: u64,

    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub governor: TrafficGovernor,

    pub relays: RelayTable,

    pub watermark: Option<Watermark>,
    pub watermark_preview_visible: bool,

    pub audio_muted: bool,
    pub video_muted: bool,

    /// Push straight to this CDN instead of the cloud edge
    pub direct_cdn: Option<CdnConfig>,

    pub extra_info: String,

    pub mirror_mode: MirrorMode,

    /// Local preview target
    pub preview: Option<Canvas>,

    /// SEI payloads waiting for the next transmitted video frame
    pub sei_queue: VecDeque<Bytes>,

    pub counters: PublishCounters,

    /// Latest uplink sample from the transport
    pub last_network: NetworkSample,

    pub first_video_captured: bool,
    pub first_audio_captured: bool,
    pub captured_size: Option<Size>,

    /// Publish request loop while `PublishRequesting`
    pub request_task: Option<JoinHandle<()>>,

    /// Quality reporter while `Publishing`
    pub quality_task: Option<JoinHandle<()>>,
}

impl ChannelState {
    pub fn new(channel: PublishChannel) -> Self {
        let video = VideoConfig::default();
        let audio = AudioConfig::default();
        Self {
            channel,
            stream_id: None,
            room_id: None,
            state: PublisherState::NoPublish,
            generation: 0,
            video,
            audio,
            governor: TrafficGovernor::new(video, audio, TrafficControlPolicy::default()),
            relays: RelayTable::new(),
            watermark: None,
            watermark_preview_visible: true,
            audio_muted: false,
            video_muted: false,
            direct_cdn: None,
            extra_info: String::new(),
            mirror_mode: MirrorMode::default(),
            preview: None,
            sei_queue: VecDeque::new(),
            counters: PublishCounters::default(),
            last_network: NetworkSample::default(),
            first_video_captured: false,
            first_audio_captured: false,
            captured_size: None,
            request_task: None,
            quality_task: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != PublisherState::NoPublish
    }

    /// Whether `stream_id` is the stream this channel publishes
    pub fn publishes(&self, stream_id: &str) -> bool {
        self.is_active() && self.stream_id.as_deref() == Some(stream_id)
    }

    /// A request loop must be started for the channel to make progress
    pub fn needs_request(&self) -> bool {
        self.state == PublisherState::PublishRequesting
            && self.request_task.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn abort_tasks(&mut self) {
        if let Some(task) = self.request_task.take() {
            task.abort();
        }
        if let Some(task) = self.quality_task.take() {
            task.abort();
        }
    }

    pub fn state_event(&self, error_code: i32, extended_data: ExtendedData) -> PublisherEvent {
        PublisherEvent::StateUpdate {
            stream_id: self.stream_id.clone().unwrap_or_default(),
            channel: self.channel,
            state: self.state,
            error_code,
            extended_data,
        }
    }

    pub fn relay_event(&self) -> Option<PublisherEvent> {
        let stream_id = self.stream_id.clone()?;
        Some(PublisherEvent::RelayCdnStateUpdate {
            stream_id,
            infos: self.relays.infos(),
        })
    }

    /// Forget the publish session, keeping configuration
    pub fn reset_session(&mut self) {
        self.abort_tasks();
        self.stream_id = None;
        self.room_id = None;
        self.state = PublisherState::NoPublish;
        self.relays = RelayTable::new();
        self.sei_queue.clear();
        self.counters = PublishCounters::default();
        self.last_network = NetworkSample::default();
        self.governor.reset();
    }
}
