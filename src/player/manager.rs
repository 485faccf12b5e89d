//! Play stream manager
//!
//! One state machine per played stream:
//!
//! ```text
//! NoPlay ──start──► PlayRequesting ──ack──► Playing
//!                      ▲    │                  │
//!                      │    └─ fatal / stop ───┼──► NoPlay (entry dropped)
//!                      └──── interrupted ──────┘
//! ```
//!
//! Cloud-routed plays follow the state of the room they were started in.
//! CDN plays pull straight from their URL and ignore room connectivity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::engine::EngineContext;
use crate::error::{codes, Error, Result};
use crate::event::{ExtendedData, PlayerEvent};
use crate::media::{AudioFrame, Canvas, DeviceKind, RenderOwner, Size, VideoFrame};
use crate::retry::Backoff;
use crate::room::{RoomSignal, RoomState};
use crate::stats::{DownlinkSample, PlayStreamQuality};
use crate::transport::{ControlMessage, ControlReply, ServerPush, TransportError};

use super::types::{PlayRoute, PlayerConfig, PlayerState, PlayerVideoLayer};

struct PlayStream {
    stream_id: String,
    /// Room a cloud play belongs to, None for CDN plays
    room_id: Option<String>,
    state: PlayerState,
    generation: u64,
    config: PlayerConfig,
    canvas: Option<Canvas>,
    /// Publisher encodes a layered codec, learned from the play ack
    layered: bool,
    audio_muted: bool,
    video_muted: bool,
    volume: u8,
    audio_received: bool,
    video_received: bool,
    video_rendered: bool,
    video_size: Option<Size>,
    last_sample: DownlinkSample,
    request_task: Option<JoinHandle<()>>,
    quality_task: Option<JoinHandle<()>>,
}

impl PlayStream {
    fn route(&self) -> PlayRoute {
        match &self.config.cdn_config {
            Some(cdn) => PlayRoute::Cdn(cdn.clone()),
            None => PlayRoute::Cloud {
                stream_id: self.stream_id.clone(),
            },
        }
    }

    fn state_event(&self, error_code: i32, extended_data: ExtendedData) -> PlayerEvent {
        PlayerEvent::StateUpdate {
            stream_id: self.stream_id.clone(),
            state: self.state,
            error_code,
            extended_data,
        }
    }

    fn needs_request(&self) -> bool {
        self.state == PlayerState::PlayRequesting
            && self.request_task.as_ref().map_or(true, |t| t.is_finished())
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.request_task.take() {
            task.abort();
        }
        if let Some(task) = self.quality_task.take() {
            task.abort();
        }
    }
}

/// Owns every played stream
pub struct PlayerManager {
    ctx: Arc<EngineContext>,
    streams: Mutex<HashMap<String, PlayStream>>,
    next_generation: AtomicU64,
}

impl PlayerManager {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            streams: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Start playing a stream
    ///
    /// Calling this again for a stream already being played only updates the
    /// canvas and the video layer.
    pub fn start_playing_stream(
        self: &Arc<Self>,
        stream_id: &str,
        canvas: Option<Canvas>,
        config: PlayerConfig,
    ) -> Result<()> {
        self.ctx.config.limits.check_stream_id(stream_id)?;

        let mut streams = self.streams.lock();
        if streams.contains_key(stream_id) {
            drop(streams);
            tracing::debug!(stream = %stream_id, "Already playing, updating view and layer");
            if let Some(canvas) = canvas {
                self.update_play_view(stream_id, canvas)?;
            }
            return self.set_play_video_layer(stream_id, config.video_layer);
        }

        let room_id = match config.cdn_config {
            Some(_) => None,
            None => Some(self.ctx.registry.first_active_room().ok_or(Error::NotLoggedIn)?),
        };

        if let Some(canvas) = &canvas {
            self.ctx
                .bind_canvas(canvas, RenderOwner::Play(stream_id.to_string()));
        }
        self.ctx.registry.register_play(stream_id, room_id.as_deref());

        let generation = self.next_generation();
        let mut stream = PlayStream {
            stream_id: stream_id.to_string(),
            room_id,
            state: PlayerState::PlayRequesting,
            generation,
            config,
            canvas,
            layered: false,
            audio_muted: false,
            video_muted: false,
            volume: 100,
            audio_received: false,
            video_received: false,
            video_rendered: false,
            video_size: None,
            last_sample: DownlinkSample::default(),
            request_task: None,
            quality_task: None,
        };

        tracing::info!(stream = %stream_id, room = ?stream.room_id, cdn = stream.config.cdn_config.is_some(), "Play requested");
        self.ctx.emit(stream.state_event(codes::SUCCESS, ExtendedData::new()));

        if self.route_ready(&stream) {
            stream.request_task = Some(self.spawn_request(stream_id, generation));
        }
        streams.insert(stream_id.to_string(), stream);
        Ok(())
    }

    /// Stop playing. Stopping a stream that is not played is a no-op.
    pub fn stop_playing_stream(&self, stream_id: &str) {
        let Some(stream) = self.streams.lock().remove(stream_id) else {
            tracing::debug!(stream = %stream_id, "Stop ignored, not playing");
            return;
        };

        tracing::info!(stream = %stream_id, "Play stopped");
        self.finish(stream, codes::SUCCESS, ExtendedData::new());
        self.send_in_background(ControlMessage::StopPlay {
            stream_id: stream_id.to_string(),
        });
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.streams.lock().keys().cloned().collect();
        for stream_id in ids {
            self.stop_playing_stream(&stream_id);
        }
    }

    pub fn state(&self, stream_id: &str) -> PlayerState {
        self.streams
            .lock()
            .get(stream_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Move a played stream to another canvas
    pub fn update_play_view(&self, stream_id: &str, canvas: Canvas) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| Error::NotPlaying(stream_id.to_string()))?;

        self.ctx
            .bind_canvas(&canvas, RenderOwner::Play(stream_id.to_string()));
        stream.canvas = Some(canvas);
        Ok(())
    }

    /// Select the layer of a layered stream. Ignored for single-layer streams.
    pub fn set_play_video_layer(&self, stream_id: &str, layer: PlayerVideoLayer) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| Error::NotPlaying(stream_id.to_string()))?;

        if stream.config.video_layer == layer {
            return Ok(());
        }
        stream.config.video_layer = layer;

        if stream.state != PlayerState::Playing {
            return Ok(());
        }
        if !stream.layered {
            tracing::debug!(stream = %stream_id, layer = ?layer, "Video layer ignored, stream is not layered");
            return Ok(());
        }
        drop(streams);

        self.send_in_background(ControlMessage::SetVideoLayer {
            stream_id: stream_id.to_string(),
            layer,
        });
        Ok(())
    }

    /// Stop local audio output for a stream
    pub fn mute_play_stream_audio(&self, stream_id: &str, mute: bool) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| Error::NotPlaying(stream_id.to_string()))?;
        stream.audio_muted = mute;
        Ok(())
    }

    /// Stop rendering a stream's video
    pub fn mute_play_stream_video(&self, stream_id: &str, mute: bool) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| Error::NotPlaying(stream_id.to_string()))?;
        stream.video_muted = mute;
        if mute {
            self.ctx
                .release_canvas(&RenderOwner::Play(stream_id.to_string()));
        } else if let Some(canvas) = &stream.canvas {
            self.ctx
                .bind_canvas(canvas, RenderOwner::Play(stream_id.to_string()));
        }
        Ok(())
    }

    /// Local playout volume, 0 ~ 100
    pub fn set_play_volume(&self, stream_id: &str, volume: u8) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| Error::NotPlaying(stream_id.to_string()))?;
        stream.volume = volume.min(100);
        Ok(())
    }

    /// Feed a decoded remote video frame
    pub fn on_remote_video_frame(&self, stream_id: &str, frame: &VideoFrame) {
        let mut streams = self.streams.lock();
        let Some(stream) = streams
            .get_mut(stream_id)
            .filter(|s| s.state == PlayerState::Playing)
        else {
            return;
        };

        let mut events = Vec::new();
        if !stream.video_received {
            stream.video_received = true;
            events.push(PlayerEvent::RecvVideoFirstFrame {
                stream_id: stream_id.to_string(),
            });
        }
        if stream.video_size != Some(frame.size) {
            stream.video_size = Some(frame.size);
            events.push(PlayerEvent::VideoSizeChanged {
                stream_id: stream_id.to_string(),
                size: frame.size,
            });
        }

        if !stream.video_muted {
            if let Some(canvas) = &stream.canvas {
                let owner = RenderOwner::Play(stream_id.to_string());
                if self.ctx.render(canvas, &owner, frame, false) && !stream.video_rendered {
                    stream.video_rendered = true;
                    events.push(PlayerEvent::RenderVideoFirstFrame {
                        stream_id: stream_id.to_string(),
                    });
                }
            }
        }

        self.ctx
            .events
            .emit_batch(events.into_iter().map(Into::into).collect());
    }

    /// Feed a decoded remote audio frame
    pub fn on_remote_audio_frame(&self, stream_id: &str, frame: &AudioFrame) {
        let mut streams = self.streams.lock();
        let Some(stream) = streams
            .get_mut(stream_id)
            .filter(|s| s.state == PlayerState::Playing)
        else {
            return;
        };

        if !stream.audio_received {
            stream.audio_received = true;
            self.ctx.emit(PlayerEvent::RecvAudioFirstFrame {
                stream_id: stream_id.to_string(),
            });
        }
        if !stream.audio_muted {
            self.ctx.audio_output.play(frame, stream.volume);
        }
    }

    /// Handle a play-scoped server push. Returns false if the push is not
    /// about playing.
    pub(crate) fn handle_push(self: &Arc<Self>, push: &ServerPush) -> bool {
        match push {
            ServerPush::DownlinkStats { stream_id, sample } => {
                if let Some(stream) = self.streams.lock().get_mut(stream_id) {
                    stream.last_sample = *sample;
                }
            }
            ServerPush::PlayerMediaEvent { stream_id, event } => {
                self.emit_if_playing(stream_id, || PlayerEvent::MediaEvent {
                    stream_id: stream_id.clone(),
                    event: *event,
                });
            }
            ServerPush::PlayerSei { stream_id, data } => {
                self.emit_if_playing(stream_id, || PlayerEvent::RecvSei {
                    stream_id: stream_id.clone(),
                    data: Bytes::clone(data),
                });
            }
            ServerPush::RemoteDeviceState {
                stream_id,
                device,
                state,
            } => {
                let stream_id = stream_id.clone();
                let state = *state;
                self.emit_if_playing(&stream_id, || match device {
                    DeviceKind::Camera => PlayerEvent::RemoteCameraStateUpdate {
                        stream_id: stream_id.clone(),
                        state,
                    },
                    DeviceKind::Microphone => PlayerEvent::RemoteMicStateUpdate {
                        stream_id: stream_id.clone(),
                        state,
                    },
                });
            }
            ServerPush::PlayInterrupted { stream_id, reason } => {
                let mut streams = self.streams.lock();
                let Some(stream) = streams.get_mut(stream_id) else {
                    return true;
                };

                if reason.is_transient() {
                    if stream.state == PlayerState::Playing {
                        tracing::warn!(stream = %stream_id, reason = ?reason, "Play interrupted, retrying");
                        self.interrupt(stream);
                        if self.route_ready(stream) {
                            let generation = stream.generation;
                            stream.request_task = Some(self.spawn_request(stream_id, generation));
                        }
                    }
                } else if let Some(stream) = streams.remove(stream_id) {
                    drop(streams);
                    let code = TransportError::new(*reason, "play interrupted").code();
                    tracing::warn!(stream = %stream_id, reason = ?reason, "Play terminated by server");
                    self.finish(stream, code, ExtendedData::new());
                }
            }
            _ => return false,
        }
        true
    }

    pub(crate) fn on_room_signal(self: &Arc<Self>, signal: &RoomSignal) {
        match signal {
            RoomSignal::Connected(room) => {
                let mut streams = self.streams.lock();
                for stream in streams.values_mut() {
                    if stream.room_id.as_deref() == Some(room.as_str()) && stream.needs_request() {
                        let generation = stream.generation;
                        stream.request_task = Some(self.spawn_request(&stream.stream_id, generation));
                    }
                }
            }
            RoomSignal::Interrupted(room) => {
                let mut streams = self.streams.lock();
                for stream in streams.values_mut() {
                    if stream.room_id.as_deref() != Some(room.as_str()) {
                        continue;
                    }
                    if let Some(task) = stream.request_task.take() {
                        task.abort();
                    }
                    if stream.state == PlayerState::Playing {
                        self.interrupt(stream);
                    }
                }
            }
            RoomSignal::Closed { room_id, error_code } => {
                let closed: Vec<PlayStream> = {
                    let mut streams = self.streams.lock();
                    let ids: Vec<String> = streams
                        .values()
                        .filter(|s| s.room_id.as_deref() == Some(room_id.as_str()))
                        .map(|s| s.stream_id.clone())
                        .collect();
                    ids.iter().filter_map(|id| streams.remove(id)).collect()
                };
                for stream in closed {
                    tracing::info!(stream = %stream.stream_id, room = %room_id, "Room closed, play stopped");
                    self.finish(stream, *error_code, ExtendedData::new());
                }
            }
        }
    }

    fn emit_if_playing(&self, stream_id: &str, event: impl FnOnce() -> PlayerEvent) {
        let streams = self.streams.lock();
        if streams
            .get(stream_id)
            .map_or(false, |s| s.state == PlayerState::Playing)
        {
            self.ctx.emit(event());
        }
    }

    /// CDN plays are always routable, cloud plays need a connected room
    fn route_ready(&self, stream: &PlayStream) -> bool {
        match &stream.room_id {
            None => true,
            Some(room) => self.ctx.registry.room_state(room) == RoomState::Connected,
        }
    }

    /// Playing → PlayRequesting after a transient loss
    fn interrupt(&self, stream: &mut PlayStream) {
        stream.abort_tasks();
        stream.generation = self.next_generation();
        stream.state = PlayerState::PlayRequesting;
        self.ctx
            .emit(stream.state_event(codes::NETWORK_INTERRUPTED, ExtendedData::new()));
    }

    /// Tear down a stream already removed from the map
    fn finish(&self, mut stream: PlayStream, error_code: i32, extended_data: ExtendedData) {
        stream.abort_tasks();
        self.ctx.registry.unregister_play(&stream.stream_id);
        self.ctx
            .release_canvas(&RenderOwner::Play(stream.stream_id.clone()));
        stream.state = PlayerState::NoPlay;
        self.ctx.emit(stream.state_event(error_code, extended_data));
    }

    fn fail(&self, stream_id: &str, generation: u64, error_code: i32, extended_data: ExtendedData) {
        let mut streams = self.streams.lock();
        if streams.get(stream_id).map(|s| s.generation) != Some(generation) {
            return;
        }
        let Some(mut stream) = streams.remove(stream_id) else {
            return;
        };
        drop(streams);

        tracing::warn!(stream = %stream_id, error_code = error_code, "Play failed");
        // The failing loop is the one running this, let it return on its own
        stream.request_task = None;
        self.finish(stream, error_code, extended_data);
    }

    fn send_in_background(&self, message: ControlMessage) {
        let transport = self.ctx.transport.clone();
        self.ctx.spawn(async move {
            let name = message.name();
            if let Err(e) = transport.send_control(message).await {
                tracing::warn!(request = name, error = %e, "Play control request failed");
            }
        });
    }

    fn spawn_request(self: &Arc<Self>, stream_id: &str, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        let stream_id = stream_id.to_string();
        self.ctx
            .spawn(async move { this.request_loop(stream_id, generation).await })
    }

    async fn request_loop(self: Arc<Self>, stream_id: String, generation: u64) {
        let mut backoff = Backoff::new(self.ctx.config.retry.clone());

        loop {
            let request = {
                let streams = self.streams.lock();
                let Some(stream) = streams.get(&stream_id) else {
                    return;
                };
                if stream.generation != generation || stream.state != PlayerState::PlayRequesting {
                    return;
                }
                ControlMessage::StartPlay {
                    room_id: stream.room_id.clone(),
                    stream_id: stream_id.clone(),
                    route: stream.route(),
                    video_layer: stream.config.video_layer,
                }
            };

            match self.ctx.transport.send_control(request).await {
                Ok(reply) => {
                    let layered = matches!(reply, ControlReply::PlayAccepted { layered: true });
                    self.on_playing(&stream_id, generation, layered);
                    return;
                }
                Err(err) if err.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            stream = %stream_id,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Play request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        let mut data = ExtendedData::new();
                        data.insert("attempts".into(), json!(backoff.attempt()));
                        self.fail(&stream_id, generation, codes::NETWORK_TIMEOUT, data);
                        return;
                    }
                },
                Err(err) => {
                    let mut data = ExtendedData::new();
                    data.insert("reason".into(), json!(err.message));
                    self.fail(&stream_id, generation, err.code(), data);
                    return;
                }
            }
        }
    }

    fn on_playing(self: &Arc<Self>, stream_id: &str, generation: u64, layered: bool) {
        let mut streams = self.streams.lock();
        let Some(stream) = streams.get_mut(stream_id) else {
            return;
        };
        if stream.generation != generation || stream.state != PlayerState::PlayRequesting {
            tracing::debug!(stream = %stream_id, "Stale play result dropped");
            return;
        }

        stream.state = PlayerState::Playing;
        stream.layered = layered;
        stream.request_task = None;
        tracing::info!(stream = %stream_id, layered = layered, "Playing");
        self.ctx.emit(stream.state_event(codes::SUCCESS, ExtendedData::new()));
        stream.quality_task = Some(self.spawn_quality(stream_id, generation));
    }

    fn spawn_quality(self: &Arc<Self>, stream_id: &str, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        let stream_id = stream_id.to_string();
        let interval = self.ctx.config.quality_interval;
        self.ctx.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let event = {
                    let streams = this.streams.lock();
                    let Some(stream) = streams.get(&stream_id) else {
                        return;
                    };
                    if stream.generation != generation || stream.state != PlayerState::Playing {
                        return;
                    }
                    PlayerEvent::QualityUpdate {
                        stream_id: stream_id.clone(),
                        quality: PlayStreamQuality::from_sample(&stream.last_sample),
                    }
                };
                this.ctx.emit(event);
            }
        })
    }
}
