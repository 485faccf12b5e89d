//! Publish channel manager
//!
//! One state machine per channel:
//!
//! ```text
//! NoPublish ──start──► PublishRequesting ──ack──► Publishing
//!     ▲                   │      ▲                    │
//!     │  stop / fatal     │      └── interrupted ─────┘
//!     └───────────────────┴───────────────────────────┘
//! ```
//!
//! A request loop runs while a channel is `PublishRequesting` and its room is
//! connected. Captured frames enter through the capture path, pass the traffic
//! governor and leave through the transport.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::completion::Completion;
use crate::engine::EngineContext;
use crate::error::{codes, Error, Result};
use crate::event::{DeviceEvent, EngineEvent, ExtendedData, PublisherEvent};
use crate::media::{AudioFrame, Canvas, DeviceKind, MirrorMode, RemoteDeviceState, RenderOwner, VideoFrame};
use crate::relay::{is_relay_target, AddOutcome, CdnConfig, RelayCdnState, RelayUpdateReason};
use crate::retry::Backoff;
use crate::room::{RoomSignal, RoomState};
use crate::transport::{
    ControlMessage, MediaPacket, ServerPush, TransportError, TransportErrorKind, VideoEncodeParams,
};

use super::channel::ChannelState;
use super::config::{
    AudioConfig, MinVideoBitrateMode, PublishChannel, PublisherState, TrafficControlProperty,
    VideoConfig, Watermark, MAX_AUDIO_BITRATE, MAX_FPS, MAX_VIDEO_BITRATE,
};
use super::traffic::EncodeDecision;

/// Receives decoded media player audio to mix into the main channel
pub trait AuxAudioSink: Send + Sync + 'static {
    fn push_aux_audio(&self, frame: &AudioFrame);
}

fn relay_reason(err: &TransportError) -> RelayUpdateReason {
    match err.kind {
        TransportErrorKind::Relay(reason) => reason,
        _ => RelayUpdateReason::ServerError,
    }
}

/// Owns both publish channels
pub struct PublisherManager {
    ctx: Arc<EngineContext>,
    channels: [Mutex<ChannelState>; 2],
    next_generation: AtomicU64,
    capture_volume: AtomicU8,
    hardware_encoder: AtomicBool,
}

impl PublisherManager {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            channels: [
                Mutex::new(ChannelState::new(PublishChannel::Main)),
                Mutex::new(ChannelState::new(PublishChannel::Aux)),
            ],
            next_generation: AtomicU64::new(1),
            capture_volume: AtomicU8::new(100),
            hardware_encoder: AtomicBool::new(false),
        })
    }

    fn channel(&self, channel: PublishChannel) -> &Mutex<ChannelState> {
        &self.channels[channel.index()]
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Start publishing `stream_id` on `channel`
    ///
    /// The stream goes into the earliest joined room that is not
    /// disconnected. Starting the stream a channel already publishes is a
    /// no-op.
    pub fn start_publishing(self: &Arc<Self>, stream_id: &str, channel: PublishChannel) -> Result<()> {
        self.ctx.config.limits.check_stream_id(stream_id)?;
        let room_id = self.ctx.registry.first_active_room().ok_or(Error::NotLoggedIn)?;

        let mut state = self.channel(channel).lock();
        if state.is_active() {
            return match state.stream_id.as_deref() {
                Some(current) if current == stream_id => {
                    tracing::debug!(stream = %stream_id, channel = ?channel, "Start ignored, already publishing");
                    Ok(())
                }
                current => Err(Error::ChannelBusy(current.unwrap_or_default().to_string())),
            };
        }

        self.ctx.registry.claim_stream(stream_id, channel, &room_id)?;

        let generation = self.next_generation();
        state.stream_id = Some(stream_id.to_string());
        state.room_id = Some(room_id.clone());
        state.state = PublisherState::PublishRequesting;
        state.generation = generation;
        state.governor.reset();

        tracing::info!(stream = %stream_id, channel = ?channel, room = %room_id, "Publishing requested");
        self.ctx.emit(state.state_event(codes::SUCCESS, ExtendedData::new()));

        // Otherwise the room's Connected signal starts the request
        if self.ctx.registry.room_state(&room_id) == RoomState::Connected {
            state.request_task = Some(self.spawn_request(channel, generation));
        }
        Ok(())
    }

    /// Stop publishing. Stopping an idle channel is a no-op.
    pub fn stop_publishing(&self, channel: PublishChannel) {
        let mut state = self.channel(channel).lock();
        if !state.is_active() {
            tracing::debug!(channel = ?channel, "Stop ignored, not publishing");
            return;
        }

        let stream_id = state.stream_id.clone().unwrap_or_default();
        let room_id = state.room_id.clone().unwrap_or_default();
        tracing::info!(stream = %stream_id, channel = ?channel, "Publishing stopped");
        self.finish(&mut state, codes::SUCCESS, ExtendedData::new());
        drop(state);

        self.send_in_background(vec![ControlMessage::StopPublish { room_id, stream_id }]);
    }

    pub fn stop_all(&self) {
        for channel in PublishChannel::ALL {
            self.stop_publishing(channel);
        }
    }

    pub fn state(&self, channel: PublishChannel) -> PublisherState {
        self.channel(channel).lock().state
    }

    pub fn stream_id(&self, channel: PublishChannel) -> Option<String> {
        let state = self.channel(channel).lock();
        state.stream_id.clone().filter(|_| state.is_active())
    }

    /// Encoder settings currently chosen by traffic control
    pub fn encode_decision(&self, channel: PublishChannel) -> EncodeDecision {
        self.channel(channel).lock().governor.decision()
    }

    /// Update the extra info attached to the channel's stream
    ///
    /// While not publishing the value is stored and sent with the next
    /// publish request.
    pub fn set_stream_extra_info(&self, extra_info: &str, channel: PublishChannel) -> Result<Completion<()>> {
        self.ctx.config.limits.check_extra_info(extra_info)?;

        let mut state = self.channel(channel).lock();
        state.extra_info = extra_info.to_string();

        let (Some(stream_id), Some(room_id)) = (state.stream_id.clone(), state.room_id.clone()) else {
            return Ok(Completion::ready(Ok(())));
        };
        if state.state != PublisherState::Publishing {
            return Ok(Completion::ready(Ok(())));
        }
        drop(state);

        let (completer, completion) = Completion::channel();
        let transport = self.ctx.transport.clone();
        let message = ControlMessage::SetStreamExtraInfo {
            room_id,
            stream_id,
            extra_info: extra_info.to_string(),
        };
        self.ctx.spawn(async move {
            let result = transport.send_control(message).await;
            completer.complete(result.map(|_| ()).map_err(Error::from));
        });
        Ok(completion)
    }

    /// Queue an SEI payload for the next transmitted video frame
    pub fn send_sei(&self, data: Bytes, channel: PublishChannel) -> Result<()> {
        let max_len = self.ctx.config.sei_max_len;
        if data.is_empty() || data.len() > max_len {
            return Err(Error::InvalidParameter(format!(
                "sei payload of {} bytes, limit is {}",
                data.len(),
                max_len
            )));
        }

        let mut state = self.channel(channel).lock();
        if state.state != PublisherState::Publishing {
            return Err(Error::InvalidState(format!("{:?} channel is not publishing", channel)));
        }
        if state.video_muted || state.governor.decision().video_suspended() {
            tracing::debug!(channel = ?channel, "SEI dropped, video not flowing");
            return Ok(());
        }

        if state.sei_queue.len() >= self.ctx.config.sei_queue_limit {
            state.sei_queue.pop_front();
            tracing::warn!(channel = ?channel, "SEI queue full, oldest payload dropped");
        }
        state.sei_queue.push_back(data);
        Ok(())
    }

    /// Feed a captured video frame
    pub fn on_captured_video_frame(&self, channel: PublishChannel, frame: VideoFrame) {
        let mut state = self.channel(channel).lock();
        state.counters.video_captured.record(frame.data.len());

        if !state.first_video_captured {
            state.first_video_captured = true;
            self.ctx.emit(PublisherEvent::CapturedVideoFirstFrame { channel });
        }
        if state.captured_size != Some(frame.size) {
            state.captured_size = Some(frame.size);
            self.ctx.emit(PublisherEvent::VideoSizeChanged {
                size: frame.size,
                channel,
            });
        }

        if let Some(canvas) = state.preview {
            let mirror = state.mirror_mode.mirrors_preview();
            self.ctx
                .render(&canvas, &RenderOwner::Preview(channel), &frame, mirror);
        }

        if state.state != PublisherState::Publishing || state.video_muted {
            return;
        }
        if !state.governor.admit_video(frame.timestamp_ms) {
            return;
        }

        let decision = state.governor.decision();
        let len = frame.data.len();
        state.counters.video_encoded.record(len);

        let packet = MediaPacket::Video {
            frame,
            params: VideoEncodeParams {
                resolution: decision.resolution,
                fps: decision.fps,
                bitrate: decision.video_bitrate,
                mirror: state.mirror_mode.mirrors_publish(),
            },
            sei: state.sei_queue.drain(..).collect(),
        };
        match self.ctx.transport.send_media(channel, packet) {
            Ok(()) => state.counters.video_sent.record(len),
            Err(e) => tracing::debug!(channel = ?channel, error = %e, "Video frame not sent"),
        }
    }

    /// Feed a captured audio frame
    pub fn on_captured_audio_frame(&self, channel: PublishChannel, frame: AudioFrame) {
        let mut state = self.channel(channel).lock();
        state.counters.audio_captured.record(frame.data.len());

        if channel == PublishChannel::Main && !state.first_audio_captured {
            state.first_audio_captured = true;
            self.ctx.emit(PublisherEvent::CapturedAudioFirstFrame);
        }

        if state.state != PublisherState::Publishing || state.audio_muted {
            return;
        }

        let len = frame.data.len();
        let packet = MediaPacket::Audio {
            frame,
            bitrate: state.governor.decision().audio_bitrate,
            volume: self.capture_volume.load(Ordering::Relaxed),
        };
        match self.ctx.transport.send_media(channel, packet) {
            Ok(()) => state.counters.audio_sent.record(len),
            Err(e) => tracing::debug!(channel = ?channel, error = %e, "Audio frame not sent"),
        }
    }

    pub fn set_video_config(&self, config: VideoConfig, channel: PublishChannel) -> Result<()> {
        if config.fps == 0
            || config.fps > MAX_FPS
            || config.bitrate == 0
            || config.bitrate > MAX_VIDEO_BITRATE
            || config.encode_resolution.is_empty()
        {
            return Err(Error::InvalidParameter(format!("video config {:?}", config)));
        }

        let mut state = self.channel(channel).lock();
        state.video = config;
        state.governor.set_video_config(config);
        tracing::info!(
            channel = ?channel,
            width = config.encode_resolution.width,
            height = config.encode_resolution.height,
            fps = config.fps,
            kbps = config.bitrate,
            "Video config set"
        );
        Ok(())
    }

    pub fn video_config(&self, channel: PublishChannel) -> VideoConfig {
        self.channel(channel).lock().video
    }

    pub fn set_audio_config(&self, config: AudioConfig, channel: PublishChannel) -> Result<()> {
        if config.bitrate == 0 || config.bitrate > MAX_AUDIO_BITRATE {
            return Err(Error::InvalidParameter(format!("audio bitrate {}", config.bitrate)));
        }

        let mut state = self.channel(channel).lock();
        state.audio = config;
        state.governor.set_audio_config(config);
        tracing::info!(channel = ?channel, kbps = config.bitrate, "Audio config set");
        Ok(())
    }

    pub fn audio_config(&self, channel: PublishChannel) -> AudioConfig {
        self.channel(channel).lock().audio
    }

    /// Enable or disable traffic control. Only allowed before publishing.
    pub fn enable_traffic_control(
        &self,
        enable: bool,
        property: TrafficControlProperty,
        channel: PublishChannel,
    ) -> Result<()> {
        let mut state = self.channel(channel).lock();
        if state.is_active() {
            return Err(Error::InvalidState("traffic control is set before publishing".into()));
        }

        let mut policy = state.governor.policy();
        policy.enabled = enable;
        policy.property = property;
        state.governor.set_policy(policy);
        Ok(())
    }

    pub fn set_min_video_bitrate_for_traffic_control(
        &self,
        kbps: u32,
        mode: MinVideoBitrateMode,
        channel: PublishChannel,
    ) {
        let mut state = self.channel(channel).lock();
        let mut policy = state.governor.policy();
        policy.min_video_bitrate = kbps;
        policy.min_video_bitrate_mode = mode;
        state.governor.set_policy(policy);
        tracing::debug!(channel = ?channel, kbps = kbps, mode = ?mode, "Video bitrate floor set");
    }

    /// Push straight to a CDN. Only allowed before publishing.
    pub fn enable_publish_direct_to_cdn(
        &self,
        enable: bool,
        config: Option<CdnConfig>,
        channel: PublishChannel,
    ) -> Result<()> {
        let mut state = self.channel(channel).lock();
        if state.is_active() {
            return Err(Error::InvalidState("direct to CDN is set before publishing".into()));
        }

        state.direct_cdn = match (enable, config) {
            (false, _) => None,
            (true, Some(config)) if is_relay_target(&config.url) => Some(config),
            (true, config) => {
                return Err(Error::InvalidParameter(format!("direct CDN config {:?}", config)));
            }
        };
        Ok(())
    }

    pub fn set_video_mirror_mode(&self, mode: MirrorMode, channel: PublishChannel) {
        self.channel(channel).lock().mirror_mode = mode;
    }

    /// Capture gain, 0 ~ 100
    pub fn set_capture_volume(&self, volume: u8) {
        self.capture_volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn capture_volume(&self) -> u8 {
        self.capture_volume.load(Ordering::Relaxed)
    }

    pub fn enable_hardware_encoder(&self, enable: bool) {
        self.hardware_encoder.store(enable, Ordering::Relaxed);
    }

    /// Show the channel's captured video on `canvas`
    pub fn start_preview(&self, canvas: Canvas, channel: PublishChannel) {
        let mut state = self.channel(channel).lock();
        self.ctx.bind_canvas(&canvas, RenderOwner::Preview(channel));
        state.preview = Some(canvas);
    }

    pub fn stop_preview(&self, channel: PublishChannel) {
        let mut state = self.channel(channel).lock();
        if state.preview.take().is_some() {
            self.ctx.release_canvas(&RenderOwner::Preview(channel));
        }
    }

    /// Bind a local capture device to a channel, taking it from any other
    pub fn use_capture_device(&self, kind: DeviceKind, device_id: &str, channel: PublishChannel) {
        let rebind = self
            .ctx
            .capture_devices
            .bind((kind, device_id.to_string()), (kind, channel));

        if let Some((_, displaced)) = rebind.displaced_owner {
            tracing::warn!(device = %device_id, kind = ?kind, from = ?displaced, to = ?channel, "Capture device taken over");
            self.ctx.emit(DeviceEvent::CaptureDeviceDisplaced {
                kind,
                device_id: device_id.to_string(),
                channel: displaced,
            });
        }
    }

    pub fn capture_device(&self, kind: DeviceKind, channel: PublishChannel) -> Option<String> {
        self.ctx
            .capture_devices
            .resource_of(&(kind, channel))
            .map(|(_, id)| id)
    }

    /// Set or clear the watermark. The layout must fit the encode resolution.
    pub fn set_publish_watermark(
        &self,
        watermark: Option<Watermark>,
        preview_visible: bool,
        channel: PublishChannel,
    ) -> Result<()> {
        let mut state = self.channel(channel).lock();
        if let Some(mark) = &watermark {
            if !mark.layout.fits_within(state.video.encode_resolution) {
                return Err(Error::WatermarkOutOfBounds);
            }
        }

        state.watermark = watermark.clone();
        state.watermark_preview_visible = preview_visible;

        if state.state == PublisherState::Publishing {
            if let Some(stream_id) = state.stream_id.clone() {
                drop(state);
                self.send_in_background(vec![ControlMessage::SetWatermark { stream_id, watermark }]);
            }
        }
        Ok(())
    }

    /// Current watermark and whether the preview shows it
    pub fn watermark(&self, channel: PublishChannel) -> Option<(Watermark, bool)> {
        let state = self.channel(channel).lock();
        state
            .watermark
            .clone()
            .map(|w| (w, state.watermark_preview_visible))
    }

    /// Stop sending audio. Capture continues; subscribers see the microphone muted.
    pub fn mute_publish_stream_audio(&self, mute: bool, channel: PublishChannel) {
        self.set_muted(DeviceKind::Microphone, mute, channel);
    }

    /// Stop sending video. Capture and preview continue; subscribers see the
    /// camera muted.
    pub fn mute_publish_stream_video(&self, mute: bool, channel: PublishChannel) {
        self.set_muted(DeviceKind::Camera, mute, channel);
    }

    fn set_muted(&self, device: DeviceKind, mute: bool, channel: PublishChannel) {
        let mut state = self.channel(channel).lock();
        let flag = match device {
            DeviceKind::Microphone => &mut state.audio_muted,
            DeviceKind::Camera => &mut state.video_muted,
        };
        if *flag == mute {
            return;
        }
        *flag = mute;
        if device == DeviceKind::Camera && mute {
            state.sei_queue.clear();
        }

        tracing::info!(channel = ?channel, device = ?device, mute = mute, "Publish mute changed");

        if state.state != PublisherState::Publishing {
            return;
        }
        if let Some(stream_id) = state.stream_id.clone() {
            drop(state);
            self.send_in_background(vec![ControlMessage::UpdateDeviceState {
                stream_id,
                device,
                state: if mute {
                    RemoteDeviceState::Mute
                } else {
                    RemoteDeviceState::Open
                },
            }]);
        }
    }

    /// Relay a published stream to a CDN
    ///
    /// Resolves with the relay state once the server answers. Adding a URL
    /// that is already requesting or relaying resolves at once with the
    /// current state and sends nothing.
    pub fn add_publish_cdn_url(
        self: &Arc<Self>,
        stream_id: &str,
        target: CdnConfig,
    ) -> Result<Completion<RelayCdnState>> {
        if !is_relay_target(&target.url) {
            return Err(Error::InvalidParameter(format!("relay url {}", target.url)));
        }
        let channel = self
            .ctx
            .registry
            .channel_of(stream_id)
            .ok_or_else(|| Error::NotPublishing(stream_id.to_string()))?;

        let mut state = self.channel(channel).lock();
        if !state.publishes(stream_id) {
            return Err(Error::NotPublishing(stream_id.to_string()));
        }

        let outcome = state.relays.begin_add(target.clone());
        if let Some(event) = state.relay_event() {
            self.ctx.emit(event);
        }
        if let AddOutcome::AlreadyActive(current) = outcome {
            tracing::debug!(stream = %stream_id, url = %target.url, state = ?current, "Relay already active");
            return Ok(Completion::ready(Ok(current)));
        }
        drop(state);

        tracing::info!(stream = %stream_id, url = %target.url, "Relay requested");

        let (completer, completion) = Completion::channel();
        let this = self.clone();
        let stream_id = stream_id.to_string();
        self.ctx.spawn(async move {
            let url = target.url.clone();
            let request = ControlMessage::AddRelay {
                stream_id: stream_id.clone(),
                target,
            };
            let result = this.ctx.transport.send_control(request).await;
            let (relay_state, reason) = match &result {
                Ok(_) => (RelayCdnState::Relaying, RelayUpdateReason::None),
                Err(e) => (RelayCdnState::NoRelay, relay_reason(e)),
            };

            {
                let mut state = this.channel(channel).lock();
                if state.publishes(&stream_id) && state.relays.transition(&url, relay_state, reason) {
                    if let Some(event) = state.relay_event() {
                        this.ctx.emit(event);
                    }
                }
            }

            completer.complete(result.map(|_| relay_state).map_err(Error::from));
        });
        Ok(completion)
    }

    /// Stop relaying to a CDN. Removing an unknown URL succeeds.
    pub fn remove_publish_cdn_url(&self, stream_id: &str, url: &str) -> Result<Completion<()>> {
        let Some(channel) = self.ctx.registry.channel_of(stream_id) else {
            return Ok(Completion::ready(Ok(())));
        };

        let mut state = self.channel(channel).lock();
        if !state.publishes(stream_id) {
            return Ok(Completion::ready(Ok(())));
        }
        let Some(removed) = state.relays.remove(url) else {
            tracing::debug!(stream = %stream_id, url = %url, "Relay remove ignored, not relaying");
            return Ok(Completion::ready(Ok(())));
        };

        let mut infos = state.relays.infos();
        infos.push(removed);
        self.ctx.emit(PublisherEvent::RelayCdnStateUpdate {
            stream_id: stream_id.to_string(),
            infos,
        });
        drop(state);

        let (completer, completion) = Completion::channel();
        let transport = self.ctx.transport.clone();
        let request = ControlMessage::RemoveRelay {
            stream_id: stream_id.to_string(),
            url: url.to_string(),
        };
        self.ctx.spawn(async move {
            let result = transport.send_control(request).await;
            completer.complete(result.map(|_| ()).map_err(Error::from));
        });
        Ok(completion)
    }

    /// Handle a publish-scoped server push. Returns false if the push is not
    /// about publishing.
    pub(crate) fn handle_push(self: &Arc<Self>, push: &ServerPush) -> bool {
        match push {
            ServerPush::UplinkStats { channel, sample } => {
                let mut state = self.channel(*channel).lock();
                state.last_network = *sample;
                if state.state == PublisherState::Publishing {
                    state.governor.update(sample);
                }
            }
            ServerPush::RelayStateChanged {
                stream_id,
                url,
                state: relay_state,
                reason,
            } => {
                let Some(channel) = self.ctx.registry.channel_of(stream_id) else {
                    return true;
                };
                let mut state = self.channel(channel).lock();
                if state.publishes(stream_id) && state.relays.transition(url, *relay_state, *reason) {
                    tracing::info!(stream = %stream_id, url = %url, state = ?relay_state, reason = ?reason, "Relay state changed");
                    if let Some(event) = state.relay_event() {
                        self.ctx.emit(event);
                    }
                }
            }
            ServerPush::PublishInterrupted { stream_id, reason } => {
                let Some(channel) = self.ctx.registry.channel_of(stream_id) else {
                    return true;
                };
                let mut state = self.channel(channel).lock();
                if !state.publishes(stream_id) {
                    return true;
                }

                if reason.is_transient() {
                    if state.state == PublisherState::Publishing {
                        tracing::warn!(stream = %stream_id, reason = ?reason, "Publish interrupted, retrying");
                        self.interrupt(&mut state);
                        let connected = state
                            .room_id
                            .as_deref()
                            .map(|room| self.ctx.registry.room_state(room) == RoomState::Connected)
                            .unwrap_or(false);
                        if connected {
                            let generation = state.generation;
                            state.request_task = Some(self.spawn_request(channel, generation));
                        }
                    }
                } else {
                    let code = TransportError::new(*reason, "publish interrupted").code();
                    tracing::warn!(stream = %stream_id, reason = ?reason, "Publish terminated by server");
                    self.finish(&mut state, code, ExtendedData::new());
                }
            }
            _ => return false,
        }
        true
    }

    pub(crate) fn on_room_signal(self: &Arc<Self>, signal: &RoomSignal) {
        for channel in PublishChannel::ALL {
            let mut state = self.channel(channel).lock();
            let current_room = state.room_id.clone();
            let in_room = |room: &str| current_room.as_deref() == Some(room);

            match signal {
                RoomSignal::Connected(room) if in_room(room) => {
                    if state.needs_request() {
                        let generation = state.generation;
                        state.request_task = Some(self.spawn_request(channel, generation));
                    }
                }
                RoomSignal::Interrupted(room) if in_room(room) => {
                    if let Some(task) = state.request_task.take() {
                        task.abort();
                    }
                    if state.state == PublisherState::Publishing {
                        self.interrupt(&mut state);
                    }
                }
                RoomSignal::Closed { room_id, error_code } if in_room(room_id) => {
                    if state.is_active() {
                        tracing::info!(channel = ?channel, room = %room_id, "Room closed, publishing stopped");
                        self.finish(&mut state, *error_code, ExtendedData::new());
                    }
                }
                _ => {}
            }
        }
    }

    /// Publishing → PublishRequesting after a transient loss
    fn interrupt(&self, state: &mut ChannelState) {
        state.abort_tasks();
        state.generation = self.next_generation();
        state.state = PublisherState::PublishRequesting;
        self.ctx
            .emit(state.state_event(codes::NETWORK_INTERRUPTED, ExtendedData::new()));
    }

    /// Any state → NoPublish, tearing down relays and the stream id claim
    fn finish(&self, state: &mut ChannelState, error_code: i32, extended_data: ExtendedData) {
        let stream_id = state.stream_id.clone().unwrap_or_default();
        if let Err(e) = self.ctx.registry.release_stream(&stream_id, state.channel) {
            tracing::debug!(stream = %stream_id, error = %e, "No claim to release");
        }

        let relays = state.relays.teardown();
        state.abort_tasks();
        state.generation = self.next_generation();
        state.state = PublisherState::NoPublish;

        let mut batch: Vec<EngineEvent> = Vec::new();
        if !relays.is_empty() {
            batch.push(
                PublisherEvent::RelayCdnStateUpdate {
                    stream_id: stream_id.clone(),
                    infos: relays,
                }
                .into(),
            );
        }
        batch.push(state.state_event(error_code, extended_data).into());
        self.ctx.events.emit_batch(batch);

        state.reset_session();
    }

    fn fail(&self, channel: PublishChannel, generation: u64, error_code: i32, extended_data: ExtendedData) {
        let mut state = self.channel(channel).lock();
        if state.generation != generation || !state.is_active() {
            return;
        }
        tracing::warn!(stream = ?state.stream_id, channel = ?channel, error_code = error_code, "Publishing failed");
        // The failing loop is the one running this, let it return on its own
        state.request_task = None;
        self.finish(&mut state, error_code, extended_data);
    }

    fn send_in_background(&self, messages: Vec<ControlMessage>) {
        let transport = self.ctx.transport.clone();
        self.ctx.spawn(async move {
            for message in messages {
                let name = message.name();
                if let Err(e) = transport.send_control(message).await {
                    tracing::warn!(request = name, error = %e, "Publish control request failed");
                }
            }
        });
    }

    fn spawn_request(self: &Arc<Self>, channel: PublishChannel, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        self.ctx
            .spawn(async move { this.request_loop(channel, generation).await })
    }

    async fn request_loop(self: Arc<Self>, channel: PublishChannel, generation: u64) {
        let mut backoff = Backoff::new(self.ctx.config.retry.clone());

        loop {
            let (request, sent_extra_info) = {
                let state = self.channel(channel).lock();
                if state.generation != generation || state.state != PublisherState::PublishRequesting {
                    return;
                }
                let (Some(stream_id), Some(room_id)) = (state.stream_id.clone(), state.room_id.clone()) else {
                    return;
                };
                let request = ControlMessage::StartPublish {
                    room_id,
                    stream_id,
                    channel,
                    extra_info: state.extra_info.clone(),
                    direct_cdn: state.direct_cdn.clone(),
                };
                (request, state.extra_info.clone())
            };

            match self.ctx.transport.send_control(request).await {
                Ok(_) => {
                    self.on_published(channel, generation, sent_extra_info);
                    return;
                }
                Err(err) if err.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            channel = ?channel,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Publish request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        let mut data = ExtendedData::new();
                        data.insert("attempts".into(), json!(backoff.attempt()));
                        self.fail(channel, generation, codes::NETWORK_TIMEOUT, data);
                        return;
                    }
                },
                Err(err) => {
                    let mut data = ExtendedData::new();
                    data.insert("reason".into(), json!(err.message));
                    self.fail(channel, generation, err.code(), data);
                    return;
                }
            }
        }
    }

    fn on_published(self: &Arc<Self>, channel: PublishChannel, generation: u64, sent_extra_info: String) {
        let mut state = self.channel(channel).lock();
        if state.generation != generation || state.state != PublisherState::PublishRequesting {
            tracing::debug!(channel = ?channel, "Stale publish result dropped");
            return;
        }

        state.state = PublisherState::Publishing;
        state.request_task = None;
        state.counters = Default::default();
        self.ctx.emit(state.state_event(codes::SUCCESS, ExtendedData::new()));
        state.quality_task = Some(self.spawn_quality(channel, generation));

        let (Some(stream_id), Some(room_id)) = (state.stream_id.clone(), state.room_id.clone()) else {
            return;
        };
        tracing::info!(stream = %stream_id, channel = ?channel, room = %room_id, "Publishing");

        // Settings changed while the request was in flight
        let mut followups = Vec::new();
        if state.extra_info != sent_extra_info {
            followups.push(ControlMessage::SetStreamExtraInfo {
                room_id,
                stream_id: stream_id.clone(),
                extra_info: state.extra_info.clone(),
            });
        }
        if state.watermark.is_some() {
            followups.push(ControlMessage::SetWatermark {
                stream_id: stream_id.clone(),
                watermark: state.watermark.clone(),
            });
        }
        for (device, muted) in [
            (DeviceKind::Microphone, state.audio_muted),
            (DeviceKind::Camera, state.video_muted),
        ] {
            if muted {
                followups.push(ControlMessage::UpdateDeviceState {
                    stream_id: stream_id.clone(),
                    device,
                    state: RemoteDeviceState::Mute,
                });
            }
        }
        drop(state);

        if !followups.is_empty() {
            self.send_in_background(followups);
        }
    }

    fn spawn_quality(self: &Arc<Self>, channel: PublishChannel, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        let interval = self.ctx.config.quality_interval;
        self.ctx.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let event = {
                    let mut state = this.channel(channel).lock();
                    if state.generation != generation || state.state != PublisherState::Publishing {
                        return;
                    }
                    let network = state.last_network;
                    let hardware = this.hardware_encoder.load(Ordering::Relaxed);
                    let quality = state.counters.snapshot(interval, &network, hardware);
                    PublisherEvent::QualityUpdate {
                        stream_id: state.stream_id.clone().unwrap_or_default(),
                        channel,
                        quality,
                    }
                };
                this.ctx.emit(event);
            }
        })
    }
}

impl AuxAudioSink for PublisherManager {
    fn push_aux_audio(&self, frame: &AudioFrame) {
        let state = self.channel(PublishChannel::Main).lock();
        if state.state != PublisherState::Publishing || state.audio_muted {
            return;
        }
        let packet = MediaPacket::AuxAudio {
            frame: frame.clone(),
        };
        if let Err(e) = self.ctx.transport.send_media(PublishChannel::Main, packet) {
            tracing::debug!(error = %e, "Aux audio not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::event::EventCategory;
    use crate::media::{AudioChannel, Rect, Size, VideoFrameFormat};
    use crate::retry::RetryPolicy;
    use crate::stats::NetworkSample;
    use crate::test_helpers::{drain, expect_silence, next_event, settle, MockTransport, RecordingRenderer};

    struct Fixture {
        transport: Arc<MockTransport>,
        renderer: Arc<RecordingRenderer>,
        ctx: Arc<EngineContext>,
        publisher: Arc<PublisherManager>,
        events: UnboundedReceiver<EngineEvent>,
    }

    fn setup_with(config: EngineConfig) -> Fixture {
        let transport = MockTransport::new();
        let renderer = RecordingRenderer::new();
        let ctx = EngineContext::for_test_with_renderer(transport.clone(), config, renderer.clone());
        ctx.registry.set_room_state("r1", RoomState::Connected);
        let (_, events) = ctx.events.subscribe_category(EventCategory::Publisher);
        let publisher = PublisherManager::new(ctx.clone());
        Fixture {
            transport,
            renderer,
            ctx,
            publisher,
            events,
        }
    }

    fn setup() -> Fixture {
        setup_with(EngineConfig::default())
    }

    async fn next_state(rx: &mut UnboundedReceiver<EngineEvent>) -> (PublisherState, i32) {
        loop {
            if let EngineEvent::Publisher(PublisherEvent::StateUpdate {
                state, error_code, ..
            }) = next_event(rx).await
            {
                return (state, error_code);
            }
        }
    }

    async fn publish(f: &mut Fixture, stream_id: &str, channel: PublishChannel) {
        f.publisher.start_publishing(stream_id, channel).unwrap();
        assert_eq!(next_state(&mut f.events).await.0, PublisherState::PublishRequesting);
        assert_eq!(next_state(&mut f.events).await, (PublisherState::Publishing, 0));
    }

    fn video(timestamp_ms: u64) -> VideoFrame {
        VideoFrame::new(
            VideoFrameFormat::I420,
            Size::new(360, 640),
            timestamp_ms,
            Bytes::from_static(&[0; 16]),
        )
    }

    fn audio(timestamp_ms: u64) -> AudioFrame {
        AudioFrame::new(48_000, AudioChannel::Mono, timestamp_ms, Bytes::from_static(&[0; 8]))
    }

    #[tokio::test]
    async fn test_publish_goes_through_requesting() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        assert_eq!(f.publisher.state(PublishChannel::Main), PublisherState::Publishing);
        assert!(f.transport.sent().iter().any(|m| matches!(
            m,
            ControlMessage::StartPublish { room_id, stream_id, .. } if room_id == "r1" && stream_id == "s1"
        )));
    }

    #[tokio::test]
    async fn test_publish_requires_room() {
        let transport = MockTransport::new();
        let ctx = EngineContext::for_test(transport, EngineConfig::default());
        let publisher = PublisherManager::new(ctx);
        assert!(matches!(
            publisher.start_publishing("s1", PublishChannel::Main),
            Err(Error::NotLoggedIn)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut f = setup();
        f.publisher.stop_publishing(PublishChannel::Main);
        expect_silence(&mut f.events, Duration::from_millis(20)).await;

        publish(&mut f, "s1", PublishChannel::Main).await;
        f.publisher.stop_publishing(PublishChannel::Main);
        assert_eq!(next_state(&mut f.events).await, (PublisherState::NoPublish, 0));

        f.publisher.stop_publishing(PublishChannel::Main);
        expect_silence(&mut f.events, Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(f.transport.count("stop_publish"), 1);
        assert_eq!(f.ctx.registry.channel_of("s1"), None);
    }

    #[tokio::test]
    async fn test_stream_id_conflicts() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        // Same stream again is a no-op
        f.publisher.start_publishing("s1", PublishChannel::Main).unwrap();
        assert!(matches!(
            f.publisher.start_publishing("s2", PublishChannel::Main),
            Err(Error::ChannelBusy(ref id)) if id == "s1"
        ));
        assert!(matches!(
            f.publisher.start_publishing("s1", PublishChannel::Aux),
            Err(Error::StreamIdInUse(_))
        ));
        assert_eq!(f.publisher.state(PublishChannel::Aux), PublisherState::NoPublish);
        expect_silence(&mut f.events, Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_server_conflict_is_fatal() {
        let mut f = setup();
        f.transport
            .fail_next("start_publish", 1, TransportErrorKind::StreamIdConflict);

        f.publisher.start_publishing("s1", PublishChannel::Main).unwrap();
        assert_eq!(next_state(&mut f.events).await.0, PublisherState::PublishRequesting);
        assert_eq!(
            next_state(&mut f.events).await,
            (PublisherState::NoPublish, codes::PUBLISH_STREAM_ID_CONFLICT)
        );
        assert_eq!(f.transport.count("start_publish"), 1);
        // The claim is gone, the other channel may take the id
        f.publisher.start_publishing("s1", PublishChannel::Aux).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let mut f = setup();
        f.transport
            .fail_next("start_publish", 2, TransportErrorKind::Network);

        publish(&mut f, "s1", PublishChannel::Main).await;
        assert_eq!(f.transport.count("start_publish"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let config = EngineConfig::default().retry(RetryPolicy::default().max_attempts(Some(1)));
        let mut f = setup_with(config);
        f.transport
            .fail_next("start_publish", 5, TransportErrorKind::Timeout);

        f.publisher.start_publishing("s1", PublishChannel::Main).unwrap();
        next_state(&mut f.events).await;
        assert_eq!(
            next_state(&mut f.events).await,
            (PublisherState::NoPublish, codes::NETWORK_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn test_stop_while_requesting_suppresses_publishing() {
        let mut f = setup();
        f.transport.hold("start_publish");

        f.publisher.start_publishing("s1", PublishChannel::Main).unwrap();
        next_state(&mut f.events).await;
        settle().await;
        f.publisher.stop_publishing(PublishChannel::Main);
        assert_eq!(next_state(&mut f.events).await.0, PublisherState::NoPublish);

        f.transport.release("start_publish");
        expect_silence(&mut f.events, Duration::from_millis(50)).await;
        assert_eq!(f.publisher.state(PublishChannel::Main), PublisherState::NoPublish);
    }

    #[tokio::test]
    async fn test_waits_for_room_connection() {
        let mut f = setup();
        f.ctx.registry.set_room_state("r1", RoomState::Connecting);

        f.publisher.start_publishing("s1", PublishChannel::Main).unwrap();
        next_state(&mut f.events).await;
        settle().await;
        assert_eq!(f.transport.count("start_publish"), 0);

        f.ctx.registry.set_room_state("r1", RoomState::Connected);
        f.publisher.on_room_signal(&RoomSignal::Connected("r1".into()));
        assert_eq!(next_state(&mut f.events).await.0, PublisherState::Publishing);
    }

    #[tokio::test]
    async fn test_room_interruption_and_recovery() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        f.publisher.on_room_signal(&RoomSignal::Interrupted("r1".into()));
        assert_eq!(
            next_state(&mut f.events).await,
            (PublisherState::PublishRequesting, codes::NETWORK_INTERRUPTED)
        );

        f.publisher.on_room_signal(&RoomSignal::Connected("r1".into()));
        assert_eq!(next_state(&mut f.events).await, (PublisherState::Publishing, 0));
        assert_eq!(f.transport.count("start_publish"), 2);
    }

    #[tokio::test]
    async fn test_room_closed_stops_channel() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        f.publisher.on_room_signal(&RoomSignal::Closed {
            room_id: "r1".into(),
            error_code: codes::ROOM_KICKED_OUT,
        });
        assert_eq!(
            next_state(&mut f.events).await,
            (PublisherState::NoPublish, codes::ROOM_KICKED_OUT)
        );
        assert_eq!(f.ctx.registry.channel_of("s1"), None);
    }

    #[tokio::test]
    async fn test_fatal_interruption_push() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        assert!(f.publisher.handle_push(&ServerPush::PublishInterrupted {
            stream_id: "s1".into(),
            reason: TransportErrorKind::AuthFailed,
        }));
        assert_eq!(
            next_state(&mut f.events).await,
            (PublisherState::NoPublish, codes::ROOM_AUTH_FAILED)
        );
    }

    #[tokio::test]
    async fn test_add_relay_twice_sends_one_handshake() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        let first = f
            .publisher
            .add_publish_cdn_url("s1", CdnConfig::new("rtmp://x"))
            .unwrap();
        assert_eq!(first.await.unwrap(), RelayCdnState::Relaying);

        let second = f
            .publisher
            .add_publish_cdn_url("s1", CdnConfig::new("rtmp://x"))
            .unwrap();
        assert_eq!(second.await.unwrap(), RelayCdnState::Relaying);
        assert_eq!(f.transport.count("add_relay"), 1);

        // Requesting, relaying, then the replay of the current state
        let relays: Vec<_> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Publisher(PublisherEvent::RelayCdnStateUpdate { infos, .. }) => Some(infos[0].state),
                _ => None,
            })
            .collect();
        assert_eq!(
            relays,
            vec![
                RelayCdnState::RelayRequesting,
                RelayCdnState::Relaying,
                RelayCdnState::Relaying
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_failure_and_removal() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;
        f.transport.fail_next(
            "add_relay",
            1,
            TransportErrorKind::Relay(RelayUpdateReason::HandshakeFailed),
        );

        let failed = f
            .publisher
            .add_publish_cdn_url("s1", CdnConfig::new("rtmp://x"))
            .unwrap();
        assert!(failed.await.is_err());

        // Missing URL and unknown stream succeed trivially
        assert!(f
            .publisher
            .remove_publish_cdn_url("s1", "rtmp://nowhere")
            .unwrap()
            .await
            .is_ok());
        assert!(f
            .publisher
            .remove_publish_cdn_url("nope", "rtmp://x")
            .unwrap()
            .await
            .is_ok());
        assert_eq!(f.transport.count("remove_relay"), 0);

        assert!(matches!(
            f.publisher.add_publish_cdn_url("s1", CdnConfig::new("not-a-url")),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_push_and_stop_teardown() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;
        f.publisher
            .add_publish_cdn_url("s1", CdnConfig::new("rtmp://x"))
            .unwrap()
            .await
            .unwrap();
        drain(&mut f.events);

        f.publisher.handle_push(&ServerPush::RelayStateChanged {
            stream_id: "s1".into(),
            url: "rtmp://x".into(),
            state: RelayCdnState::RelayRequesting,
            reason: RelayUpdateReason::CdnServerDisconnected,
        });
        assert!(matches!(
            next_event(&mut f.events).await,
            EngineEvent::Publisher(PublisherEvent::RelayCdnStateUpdate { ref infos, .. })
                if infos[0].update_reason == RelayUpdateReason::CdnServerDisconnected
        ));

        f.publisher.stop_publishing(PublishChannel::Main);
        assert!(matches!(
            next_event(&mut f.events).await,
            EngineEvent::Publisher(PublisherEvent::RelayCdnStateUpdate { ref infos, .. })
                if infos[0].state == RelayCdnState::NoRelay
        ));
        assert_eq!(next_state(&mut f.events).await.0, PublisherState::NoPublish);
    }

    #[tokio::test]
    async fn test_ultra_low_fps_floor_keeps_audio() {
        let mut f = setup();
        f.publisher.set_min_video_bitrate_for_traffic_control(
            200,
            MinVideoBitrateMode::UltraLowFps,
            PublishChannel::Main,
        );
        publish(&mut f, "s1", PublishChannel::Main).await;

        f.publisher.handle_push(&ServerPush::UplinkStats {
            channel: PublishChannel::Main,
            sample: NetworkSample::new(50, 0.0, 50),
        });
        assert_eq!(f.publisher.encode_decision(PublishChannel::Main).fps, 2);

        // 10 seconds of capture: 15 fps video, 50 audio frames per second
        for i in 0..150u64 {
            f.publisher
                .on_captured_video_frame(PublishChannel::Main, video(i * 1000 / 15));
        }
        for i in 0..500u64 {
            f.publisher
                .on_captured_audio_frame(PublishChannel::Main, audio(i * 20));
        }

        let sent: Vec<u64> = f
            .transport
            .media()
            .into_iter()
            .filter_map(|(channel, packet)| match packet {
                MediaPacket::Video { frame, .. } if channel == PublishChannel::Main => {
                    Some(frame.timestamp_ms)
                }
                _ => None,
            })
            .collect();
        assert!((18..=20).contains(&sent.len()), "sent {:?}", sent);
        for &start in &sent {
            let in_second = sent.iter().filter(|&&ts| ts >= start && ts < start + 1000).count();
            assert!(in_second <= 2, "{} frames from {} ms: {:?}", in_second, start, sent);
        }
        assert_eq!(f.transport.audio_packets(PublishChannel::Main), 500);
    }

    #[tokio::test]
    async fn test_floor_change_does_not_undo_degradation() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        f.publisher.handle_push(&ServerPush::UplinkStats {
            channel: PublishChannel::Main,
            sample: NetworkSample::new(50, 0.0, 80),
        });
        let degraded = f.publisher.encode_decision(PublishChannel::Main);
        assert!(degraded.fps < 15);

        f.publisher.set_min_video_bitrate_for_traffic_control(
            100,
            MinVideoBitrateMode::UltraLowFps,
            PublishChannel::Main,
        );
        let after = f.publisher.encode_decision(PublishChannel::Main);
        assert!(after.fps <= degraded.fps, "{:?} after {:?}", after, degraded);
        assert!(after.below_floor);
        assert_ne!(after.video_bitrate, VideoConfig::default().bitrate);

        // A good sample recovers one step, not all the way
        f.publisher.handle_push(&ServerPush::UplinkStats {
            channel: PublishChannel::Main,
            sample: NetworkSample::new(50, 0.0, 10_000),
        });
        assert!(f.publisher.encode_decision(PublishChannel::Main).fps < 15);
    }

    #[tokio::test]
    async fn test_oversized_config_rejected() {
        let f = setup();
        let before = f.publisher.video_config(PublishChannel::Main);

        for config in [
            VideoConfig::default().fps(u32::MAX),
            VideoConfig::default().fps(MAX_FPS + 1),
            VideoConfig::default().bitrate(u32::MAX),
        ] {
            assert!(matches!(
                f.publisher.set_video_config(config, PublishChannel::Main),
                Err(Error::InvalidParameter(_))
            ));
        }
        assert_eq!(f.publisher.video_config(PublishChannel::Main), before);
        assert_eq!(f.publisher.encode_decision(PublishChannel::Main).fps, before.fps);

        let audio = AudioConfig {
            bitrate: u32::MAX,
            ..AudioConfig::default()
        };
        assert!(matches!(
            f.publisher.set_audio_config(audio, PublishChannel::Main),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(f.publisher.audio_config(PublishChannel::Main), AudioConfig::default());

        assert!(f
            .publisher
            .set_video_config(VideoConfig::default().fps(MAX_FPS), PublishChannel::Main)
            .is_ok());
    }

    #[tokio::test]
    async fn test_no_video_floor_suspends_video_and_sei() {
        let mut f = setup();
        f.publisher.set_min_video_bitrate_for_traffic_control(
            200,
            MinVideoBitrateMode::NoVideo,
            PublishChannel::Main,
        );
        publish(&mut f, "s1", PublishChannel::Main).await;
        f.publisher.handle_push(&ServerPush::UplinkStats {
            channel: PublishChannel::Main,
            sample: NetworkSample::new(50, 0.0, 50),
        });

        f.publisher
            .send_sei(Bytes::from_static(b"sync"), PublishChannel::Main)
            .unwrap();
        for i in 0..30u64 {
            f.publisher
                .on_captured_video_frame(PublishChannel::Main, video(i * 66));
        }
        f.publisher.on_captured_audio_frame(PublishChannel::Main, audio(0));

        assert_eq!(f.transport.video_packets(PublishChannel::Main), 0);
        assert_eq!(f.transport.audio_packets(PublishChannel::Main), 1);
    }

    #[tokio::test]
    async fn test_sei_rides_next_video_frame() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        f.publisher
            .send_sei(Bytes::from_static(b"a"), PublishChannel::Main)
            .unwrap();
        f.publisher
            .send_sei(Bytes::from_static(b"b"), PublishChannel::Main)
            .unwrap();
        f.publisher.on_captured_video_frame(PublishChannel::Main, video(0));
        f.publisher.on_captured_video_frame(PublishChannel::Main, video(67));

        let media = f.transport.media();
        match &media[0].1 {
            MediaPacket::Video { sei, params, .. } => {
                assert_eq!(sei, &vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
                assert!(!params.mirror);
                assert_eq!(params.bitrate, 600);
            }
            other => panic!("unexpected packet {:?}", other),
        }
        assert!(matches!(&media[1].1, MediaPacket::Video { sei, .. } if sei.is_empty()));

        assert!(matches!(
            f.publisher.send_sei(Bytes::from_static(b"x"), PublishChannel::Aux),
            Err(Error::InvalidState(_))
        ));
        assert!(f
            .publisher
            .send_sei(Bytes::from(vec![0u8; 5000]), PublishChannel::Main)
            .is_err());
    }

    #[tokio::test]
    async fn test_sei_queue_is_bounded() {
        let mut f = setup_with(EngineConfig::default().sei_queue_limit(2));
        publish(&mut f, "s1", PublishChannel::Main).await;

        for payload in ["1", "2", "3"] {
            f.publisher
                .send_sei(Bytes::from(payload), PublishChannel::Main)
                .unwrap();
        }
        f.publisher.on_captured_video_frame(PublishChannel::Main, video(0));
        assert!(matches!(
            &f.transport.media()[0].1,
            MediaPacket::Video { sei, .. } if sei == &vec![Bytes::from_static(b"2"), Bytes::from_static(b"3")]
        ));
    }

    #[tokio::test]
    async fn test_mute_video_keeps_preview() {
        let mut f = setup();
        f.publisher.start_preview(Canvas::new(7), PublishChannel::Main);
        publish(&mut f, "s1", PublishChannel::Main).await;

        f.publisher.mute_publish_stream_video(true, PublishChannel::Main);
        for i in 0..5u64 {
            f.publisher
                .on_captured_video_frame(PublishChannel::Main, video(i * 67));
        }

        assert_eq!(f.transport.video_packets(PublishChannel::Main), 0);
        assert_eq!(f.renderer.rendered_on(7), 5);
        assert_eq!(f.renderer.last_mirror(), Some(true));

        settle().await;
        assert!(f.transport.sent().contains(&ControlMessage::UpdateDeviceState {
            stream_id: "s1".into(),
            device: DeviceKind::Camera,
            state: RemoteDeviceState::Mute,
        }));
        // Muting is not a stream state change
        assert!(drain(&mut f.events)
            .iter()
            .all(|e| !matches!(e, EngineEvent::Publisher(PublisherEvent::StateUpdate { .. }))));
    }

    #[tokio::test]
    async fn test_mute_before_publish_is_announced() {
        let mut f = setup();
        f.publisher.mute_publish_stream_audio(true, PublishChannel::Main);
        publish(&mut f, "s1", PublishChannel::Main).await;
        settle().await;

        assert_eq!(f.transport.count("update_device_state"), 1);
        f.publisher.on_captured_audio_frame(PublishChannel::Main, audio(0));
        assert_eq!(f.transport.audio_packets(PublishChannel::Main), 0);
    }

    #[tokio::test]
    async fn test_preview_surface_taken_by_other_owner() {
        let f = setup();
        f.publisher.start_preview(Canvas::new(7), PublishChannel::Main);
        f.ctx
            .bind_canvas(&Canvas::new(7), RenderOwner::Play("remote".into()));

        f.publisher.on_captured_video_frame(PublishChannel::Main, video(0));
        assert_eq!(f.renderer.rendered_on(7), 0);
    }

    #[tokio::test]
    async fn test_first_frame_and_size_events() {
        let mut f = setup();
        f.publisher.on_captured_video_frame(PublishChannel::Aux, video(0));
        f.publisher.on_captured_video_frame(PublishChannel::Aux, video(67));

        assert_eq!(
            next_event(&mut f.events).await,
            EngineEvent::Publisher(PublisherEvent::CapturedVideoFirstFrame {
                channel: PublishChannel::Aux
            })
        );
        assert_eq!(
            next_event(&mut f.events).await,
            EngineEvent::Publisher(PublisherEvent::VideoSizeChanged {
                size: Size::new(360, 640),
                channel: PublishChannel::Aux
            })
        );
        expect_silence(&mut f.events, Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_watermark_bounds() {
        let f = setup();
        let outside = Watermark::new("https://img", Rect::new(0, 0, 400, 100));
        assert!(matches!(
            f.publisher
                .set_publish_watermark(Some(outside), true, PublishChannel::Main),
            Err(Error::WatermarkOutOfBounds)
        ));

        let inside = Watermark::new("https://img", Rect::new(10, 10, 100, 50));
        f.publisher
            .set_publish_watermark(Some(inside.clone()), false, PublishChannel::Main)
            .unwrap();
        assert_eq!(f.publisher.watermark(PublishChannel::Main), Some((inside, false)));
    }

    #[tokio::test]
    async fn test_settings_locked_while_publishing() {
        let mut f = setup();
        f.publisher
            .enable_publish_direct_to_cdn(true, Some(CdnConfig::new("rtmp://cdn")), PublishChannel::Main)
            .unwrap();
        assert!(f
            .publisher
            .enable_publish_direct_to_cdn(true, None, PublishChannel::Aux)
            .is_err());

        publish(&mut f, "s1", PublishChannel::Main).await;
        assert!(f.transport.sent().iter().any(|m| matches!(
            m,
            ControlMessage::StartPublish { direct_cdn: Some(cdn), .. } if cdn.url == "rtmp://cdn"
        )));

        assert!(matches!(
            f.publisher
                .enable_publish_direct_to_cdn(false, None, PublishChannel::Main),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            f.publisher.enable_traffic_control(
                false,
                TrafficControlProperty::BASIC,
                PublishChannel::Main
            ),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_extra_info() {
        let mut f = setup();
        assert!(matches!(
            f.publisher
                .set_stream_extra_info(&"x".repeat(1025), PublishChannel::Main),
            Err(Error::ExtraInfoTooLong { .. })
        ));

        // Stored before publishing and sent with the request
        f.publisher
            .set_stream_extra_info("before", PublishChannel::Main)
            .unwrap()
            .await
            .unwrap();
        publish(&mut f, "s1", PublishChannel::Main).await;
        assert!(f.transport.sent().iter().any(|m| matches!(
            m,
            ControlMessage::StartPublish { extra_info, .. } if extra_info == "before"
        )));

        f.publisher
            .set_stream_extra_info("after", PublishChannel::Main)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(f.transport.count("set_stream_extra_info"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_reports_only_while_publishing() {
        let mut f = setup();
        publish(&mut f, "s1", PublishChannel::Main).await;

        assert!(matches!(
            next_event(&mut f.events).await,
            EngineEvent::Publisher(PublisherEvent::QualityUpdate { ref stream_id, .. }) if stream_id == "s1"
        ));

        f.publisher.stop_publishing(PublishChannel::Main);
        assert_eq!(next_state(&mut f.events).await.0, PublisherState::NoPublish);
        expect_silence(&mut f.events, Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn test_capture_device_takeover() {
        let f = setup();
        let (_, mut devices) = f.ctx.events.subscribe_category(EventCategory::Device);

        f.publisher
            .use_capture_device(DeviceKind::Camera, "cam0", PublishChannel::Main);
        f.publisher
            .use_capture_device(DeviceKind::Camera, "cam0", PublishChannel::Aux);

        assert_eq!(
            next_event(&mut devices).await,
            EngineEvent::Device(DeviceEvent::CaptureDeviceDisplaced {
                kind: DeviceKind::Camera,
                device_id: "cam0".into(),
                channel: PublishChannel::Main,
            })
        );
        assert_eq!(f.publisher.capture_device(DeviceKind::Camera, PublishChannel::Main), None);
        assert_eq!(
            f.publisher.capture_device(DeviceKind::Camera, PublishChannel::Aux),
            Some("cam0".into())
        );
    }

    #[tokio::test]
    async fn test_aux_audio_only_while_publishing() {
        let mut f = setup();
        f.publisher.push_aux_audio(&audio(0));
        assert!(f.transport.media().is_empty());

        publish(&mut f, "s1", PublishChannel::Main).await;
        f.publisher.set_capture_volume(150);
        f.publisher.push_aux_audio(&audio(0));
        f.publisher.on_captured_audio_frame(PublishChannel::Main, audio(0));

        let media = f.transport.media();
        assert!(matches!(media[0].1, MediaPacket::AuxAudio { .. }));
        assert!(matches!(media[1].1, MediaPacket::Audio { volume: 100, bitrate: 48, .. }));
    }
}
