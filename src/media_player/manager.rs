//! Media player manager
//!
//! Local playback of files and network resources, independent of rooms:
//!
//! ```text
//! NoPlay ──start──► Playing ◄──resume── Pausing
//!   ▲                 │   └───pause────►   │
//!   └──── stop ───────┴────────────────────┘
//!                     │
//!                     └── resource exhausted, repeat off ──► PlayEnded
//! ```
//!
//! A clock task per playing instance reads one tick of decoded media at a
//! time and feeds the canvas, local output, the registered handlers and,
//! when aux is on, the main publish channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::completion::Completion;
use crate::engine::EngineContext;
use crate::error::{codes, Error, Result};
use crate::event::MediaPlayerEvent;
use crate::media::{Canvas, RenderOwner, VideoBufferType, VideoFrameFormat};
use crate::publisher::AuxAudioSink;

use super::pool::Arena;
use super::source::{
    AudioHandlerRef, MediaFrame, MediaResource, MediaSource, ReadOutcome, VideoHandlerRef,
};
use super::types::{MediaPlayerHandle, MediaPlayerNetworkEvent, MediaPlayerState};

struct Instance {
    handle: MediaPlayerHandle,
    state: MediaPlayerState,
    resource: Option<Box<dyn MediaResource>>,
    /// Bumped by every load so a late open result is dropped
    load_generation: u64,
    /// A clock exits once this no longer matches the value it started with
    clock_generation: u64,
    clock: Option<JoinHandle<()>>,
    duration_ms: u64,
    progress_ms: u64,
    last_report_ms: u64,
    progress_interval: Duration,
    buffering: bool,
    volume: u8,
    repeat: bool,
    aux: bool,
    mute_local: bool,
    canvas: Option<Canvas>,
    video_format: Option<(VideoFrameFormat, VideoBufferType)>,
    video_handler: Option<VideoHandlerRef>,
    audio_handler: Option<AudioHandlerRef>,
}

impl Instance {
    fn new(handle: MediaPlayerHandle, progress_interval: Duration) -> Self {
        Self {
            handle,
            state: MediaPlayerState::NoPlay,
            resource: None,
            load_generation: 0,
            clock_generation: 0,
            clock: None,
            duration_ms: 0,
            progress_ms: 0,
            last_report_ms: 0,
            progress_interval,
            buffering: false,
            volume: 100,
            repeat: false,
            aux: false,
            mute_local: false,
            canvas: None,
            video_format: None,
            video_handler: None,
            audio_handler: None,
        }
    }

    fn stop_clock(&mut self) {
        self.clock_generation += 1;
        if let Some(clock) = self.clock.take() {
            clock.abort();
        }
    }

    fn state_event(&self, error_code: i32) -> MediaPlayerEvent {
        MediaPlayerEvent::StateUpdate {
            player: self.handle,
            state: self.state,
            error_code,
        }
    }
}

type InstanceRef = Arc<Mutex<Instance>>;

/// One tick of decoded media and where it goes
struct Delivery {
    handle: MediaPlayerHandle,
    frames: Vec<MediaFrame>,
    canvas: Option<Canvas>,
    volume: u8,
    mute_local: bool,
    aux: bool,
    video_handler: Option<VideoHandlerRef>,
    audio_handler: Option<AudioHandlerRef>,
    /// Last delivery of this clock
    finished: bool,
}

/// Owns the media player arena
pub struct MediaPlayerManager {
    ctx: Arc<EngineContext>,
    source: Arc<dyn MediaSource>,
    aux_sink: Arc<dyn AuxAudioSink>,
    players: Mutex<Arena<InstanceRef>>,
}

impl MediaPlayerManager {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        source: Arc<dyn MediaSource>,
        aux_sink: Arc<dyn AuxAudioSink>,
    ) -> Arc<Self> {
        let capacity = ctx.config.media_player_capacity;
        Arc::new(Self {
            ctx,
            source,
            aux_sink,
            players: Mutex::new(Arena::new(capacity)),
        })
    }

    /// Create a player. Returns None once the pool is full.
    pub fn create_media_player(&self) -> Option<MediaPlayerHandle> {
        match self.allocate() {
            Ok(handle) => {
                tracing::info!(player = %handle, "Media player created");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Media player not created");
                None
            }
        }
    }

    fn allocate(&self) -> Result<MediaPlayerHandle> {
        let interval = self.ctx.config.media_player_progress_interval;
        let mut players = self.players.lock();
        players
            .insert_with(|handle| Arc::new(Mutex::new(Instance::new(handle, interval))))
            .ok_or_else(|| Error::PoolExhausted(players.len()))
    }

    /// Destroy a player, freeing its pool slot. Returns false for a stale handle.
    pub fn destroy_media_player(&self, handle: MediaPlayerHandle) -> bool {
        let Some(instance) = self.players.lock().remove(handle) else {
            return false;
        };

        let mut player = instance.lock();
        player.stop_clock();
        player.load_generation += 1;
        if player.canvas.take().is_some() {
            self.ctx
                .release_canvas(&RenderOwner::MediaPlayer(handle.index));
        }
        tracing::info!(player = %handle, "Media player destroyed");
        true
    }

    pub fn destroy_all(&self) {
        let handles = self.players.lock().handles();
        for handle in handles {
            self.destroy_media_player(handle);
        }
    }

    /// Live players
    pub fn live_count(&self) -> usize {
        self.players.lock().len()
    }

    fn instance(&self, handle: MediaPlayerHandle) -> Result<InstanceRef> {
        self.players
            .lock()
            .get(handle)
            .cloned()
            .ok_or(Error::PlayerDestroyed)
    }

    fn with_player<T>(&self, handle: MediaPlayerHandle, f: impl FnOnce(&mut Instance) -> T) -> Result<T> {
        let instance = self.instance(handle)?;
        let mut player = instance.lock();
        Ok(f(&mut player))
    }

    /// Open a local path or network URL. Stops current playback.
    pub fn load_resource(&self, handle: MediaPlayerHandle, path: &str) -> Result<Completion<()>> {
        let instance = self.instance(handle)?;

        let load_generation = {
            let mut player = instance.lock();
            self.halt(&mut player);
            player.resource = None;
            player.duration_ms = 0;
            player.progress_ms = 0;
            player.last_report_ms = 0;
            player.load_generation += 1;
            player.load_generation
        };

        tracing::info!(player = %handle, path = %path, "Loading media resource");

        let (completer, completion) = Completion::channel();
        let source = self.source.clone();
        let path = path.to_string();
        self.ctx.spawn(async move {
            let opened = source.open(&path).await;

            let mut player = instance.lock();
            if player.load_generation != load_generation {
                completer.complete(Err(Error::Cancelled));
                return;
            }
            match opened {
                Ok(mut resource) => {
                    if let Some((format, buffer_type)) = player.video_format {
                        resource.set_video_format(format, buffer_type);
                    }
                    player.duration_ms = resource.duration_ms();
                    player.resource = Some(resource);
                    tracing::info!(player = %handle, duration_ms = player.duration_ms, "Media resource loaded");
                    completer.complete(Ok(()));
                }
                Err(e) => {
                    tracing::warn!(player = %handle, path = %path, error = %e, "Media resource failed to load");
                    let err = match e {
                        Error::LoadFailed(_) => e,
                        other => Error::LoadFailed(other.to_string()),
                    };
                    completer.complete(Err(err));
                }
            }
        });
        Ok(completion)
    }

    /// Start playing the loaded resource
    pub fn start(self: &Arc<Self>, handle: MediaPlayerHandle) -> Result<()> {
        let instance = self.instance(handle)?;
        let mut player = instance.lock();
        if player.resource.is_none() {
            return Err(Error::ResourceNotReady);
        }

        match player.state {
            MediaPlayerState::Playing | MediaPlayerState::Pausing => return Ok(()),
            MediaPlayerState::PlayEnded => {
                player.progress_ms = 0;
                player.last_report_ms = 0;
            }
            MediaPlayerState::NoPlay => {}
        }

        player.state = MediaPlayerState::Playing;
        player.buffering = false;
        self.ctx.emit(player.state_event(codes::SUCCESS));
        tracing::debug!(player = %handle, from_ms = player.progress_ms, "Media player started");

        player.stop_clock();
        let generation = player.clock_generation;
        let this = self.clone();
        let clock_instance = instance.clone();
        player.clock = Some(
            self.ctx
                .spawn(async move { this.run_clock(clock_instance, generation).await }),
        );
        Ok(())
    }

    pub fn stop(&self, handle: MediaPlayerHandle) -> Result<()> {
        self.with_player(handle, |player| {
            self.halt(player);
            player.progress_ms = 0;
            player.last_report_ms = 0;
        })
    }

    pub fn pause(&self, handle: MediaPlayerHandle) -> Result<()> {
        self.with_player(handle, |player| match player.state {
            MediaPlayerState::Playing => {
                player.state = MediaPlayerState::Pausing;
                self.ctx.emit(player.state_event(codes::SUCCESS));
                Ok(())
            }
            MediaPlayerState::Pausing => Ok(()),
            state => Err(Error::InvalidState(format!("cannot pause in {:?}", state))),
        })?
    }

    pub fn resume(&self, handle: MediaPlayerHandle) -> Result<()> {
        self.with_player(handle, |player| match player.state {
            MediaPlayerState::Pausing => {
                player.state = MediaPlayerState::Playing;
                self.ctx.emit(player.state_event(codes::SUCCESS));
                Ok(())
            }
            MediaPlayerState::Playing => Ok(()),
            state => Err(Error::InvalidState(format!("cannot resume in {:?}", state))),
        })?
    }

    /// Move the play position. Keeps the play/pause state.
    pub fn seek_to(&self, handle: MediaPlayerHandle, millisecond: u64) -> Result<Completion<()>> {
        self.with_player(handle, |player| {
            if player.resource.is_none() {
                return Err(Error::ResourceNotReady);
            }
            if player.state == MediaPlayerState::PlayEnded {
                return Err(Error::InvalidState("cannot seek after play ended".into()));
            }
            if millisecond > player.duration_ms {
                return Err(Error::SeekOutOfRange {
                    target_ms: millisecond,
                    duration_ms: player.duration_ms,
                });
            }

            player.progress_ms = millisecond;
            player.last_report_ms = millisecond;
            tracing::debug!(player = %handle, position_ms = millisecond, "Media player seek");
            Ok(Completion::ready(Ok(())))
        })?
    }

    pub fn enable_repeat(&self, handle: MediaPlayerHandle, enable: bool) -> Result<()> {
        self.with_player(handle, |player| player.repeat = enable)
    }

    /// Mix this player's audio into the main publish channel
    pub fn enable_aux(&self, handle: MediaPlayerHandle, enable: bool) -> Result<()> {
        self.with_player(handle, |player| player.aux = enable)
    }

    /// Silence local playout. Aux audio and handlers still receive frames.
    pub fn mute_local(&self, handle: MediaPlayerHandle, mute: bool) -> Result<()> {
        self.with_player(handle, |player| player.mute_local = mute)
    }

    /// 0 ~ 100
    pub fn set_volume(&self, handle: MediaPlayerHandle, volume: u8) -> Result<()> {
        self.with_player(handle, |player| player.volume = volume.min(100))
    }

    pub fn set_progress_interval(&self, handle: MediaPlayerHandle, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidParameter("progress interval is 0".into()));
        }
        self.with_player(handle, |player| player.progress_interval = interval)
    }

    /// Render the player's video on `canvas`, or stop rendering with None
    pub fn set_player_canvas(&self, handle: MediaPlayerHandle, canvas: Option<Canvas>) -> Result<()> {
        self.with_player(handle, |player| {
            let owner = RenderOwner::MediaPlayer(handle.index);
            match &canvas {
                Some(canvas) => self.ctx.bind_canvas(canvas, owner),
                None => self.ctx.release_canvas(&owner),
            }
            player.canvas = canvas;
        })
    }

    /// Receive decoded video in the given layout, or stop with None
    pub fn set_video_handler(
        &self,
        handle: MediaPlayerHandle,
        handler: Option<VideoHandlerRef>,
        format: VideoFrameFormat,
        buffer_type: VideoBufferType,
    ) -> Result<()> {
        self.with_player(handle, |player| {
            player.video_format = handler.as_ref().map(|_| (format, buffer_type));
            player.video_handler = handler;
            if let (Some(resource), Some((format, buffer_type))) =
                (player.resource.as_mut(), player.video_format)
            {
                resource.set_video_format(format, buffer_type);
            }
        })
    }

    pub fn set_audio_handler(&self, handle: MediaPlayerHandle, handler: Option<AudioHandlerRef>) -> Result<()> {
        self.with_player(handle, |player| player.audio_handler = handler)
    }

    /// Milliseconds, 0 until a resource is loaded
    pub fn total_duration(&self, handle: MediaPlayerHandle) -> Result<u64> {
        self.with_player(handle, |player| player.duration_ms)
    }

    pub fn current_progress(&self, handle: MediaPlayerHandle) -> Result<u64> {
        self.with_player(handle, |player| player.progress_ms)
    }

    pub fn volume(&self, handle: MediaPlayerHandle) -> Result<u8> {
        self.with_player(handle, |player| player.volume)
    }

    pub fn current_state(&self, handle: MediaPlayerHandle) -> Result<MediaPlayerState> {
        self.with_player(handle, |player| player.state)
    }

    /// Back to NoPlay without touching the position
    fn halt(&self, player: &mut Instance) {
        player.stop_clock();
        player.buffering = false;
        if player.state != MediaPlayerState::NoPlay {
            player.state = MediaPlayerState::NoPlay;
            self.ctx.emit(player.state_event(codes::SUCCESS));
        }
    }

    async fn run_clock(self: Arc<Self>, instance: InstanceRef, generation: u64) {
        let tick = self.ctx.config.media_player_tick;
        let step_ms = (tick.as_millis() as u64).max(1);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(delivery) = self.advance(&instance, generation, step_ms) else {
                return;
            };
            let finished = delivery.finished;
            self.deliver(&instance, generation, delivery);
            if finished {
                return;
            }
        }
    }

    /// Move the clock one tick. None once the clock is stale.
    fn advance(&self, instance: &InstanceRef, generation: u64, step_ms: u64) -> Option<Delivery> {
        let mut player = instance.lock();
        if player.clock_generation != generation {
            return None;
        }

        let mut delivery = Delivery {
            handle: player.handle,
            frames: Vec::new(),
            canvas: player.canvas,
            volume: player.volume,
            mute_local: player.mute_local,
            aux: player.aux,
            video_handler: player.video_handler.clone(),
            audio_handler: player.audio_handler.clone(),
            finished: false,
        };
        if player.state != MediaPlayerState::Playing {
            return Some(delivery);
        }

        let from = player.progress_ms;
        let to = (from + step_ms).min(player.duration_ms);
        let outcome = player.resource.as_mut()?.read(from, to);

        match outcome {
            ReadOutcome::Buffering => {
                if !player.buffering {
                    player.buffering = true;
                    self.emit_network(player.handle, MediaPlayerNetworkEvent::BufferBegin);
                }
                return Some(delivery);
            }
            ReadOutcome::Frames(frames) => {
                if player.buffering {
                    player.buffering = false;
                    self.emit_network(player.handle, MediaPlayerNetworkEvent::BufferEnded);
                }
                delivery.frames = frames;
            }
        }

        player.progress_ms = to;
        let interval_ms = player.progress_interval.as_millis() as u64;
        if player.progress_ms - player.last_report_ms >= interval_ms {
            player.last_report_ms = player.progress_ms;
            self.ctx.emit(MediaPlayerEvent::PlayingProgress {
                player: player.handle,
                millisecond: player.progress_ms,
            });
        }

        if player.progress_ms >= player.duration_ms {
            if player.repeat {
                tracing::debug!(player = %player.handle, "Media player looped");
                player.progress_ms = 0;
                player.last_report_ms = 0;
            } else {
                player.state = MediaPlayerState::PlayEnded;
                player.clock = None;
                delivery.finished = true;
                tracing::info!(player = %player.handle, "Media player reached the end");
                self.ctx.emit(player.state_event(codes::SUCCESS));
            }
        }

        Some(delivery)
    }

    fn emit_network(&self, player: MediaPlayerHandle, event: MediaPlayerNetworkEvent) {
        self.ctx
            .emit(MediaPlayerEvent::NetworkEvent { player, event });
    }

    /// Hand decoded frames to their consumers, outside the instance lock
    ///
    /// A stop, pause or destroy issued while frames are in flight drops the
    /// rest of them.
    fn deliver(&self, instance: &InstanceRef, generation: u64, delivery: Delivery) {
        let owner = RenderOwner::MediaPlayer(delivery.handle.index);
        let live = || {
            let player = instance.lock();
            player.clock_generation == generation
                && (player.state == MediaPlayerState::Playing || delivery.finished)
        };

        for frame in &delivery.frames {
            if !live() {
                tracing::debug!(player = %delivery.handle, "Frames dropped after the clock stopped");
                return;
            }
            match frame {
                MediaFrame::Video(frame) => {
                    if let Some(canvas) = &delivery.canvas {
                        self.ctx.render(canvas, &owner, frame, false);
                    }
                    if let Some(handler) = &delivery.video_handler {
                        handler.on_video_frame(delivery.handle, frame);
                    }
                }
                MediaFrame::Audio(frame) => {
                    if !delivery.mute_local {
                        self.ctx.audio_output.play(frame, delivery.volume);
                    }
                    if let Some(handler) = &delivery.audio_handler {
                        handler.on_audio_frame(delivery.handle, frame);
                    }
                    if delivery.aux {
                        self.aux_sink.push_aux_audio(frame);
                    }
                }
            }
        }
    }
}
