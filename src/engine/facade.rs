//! Engine facade
//!
//! [`Engine`] wires the managers to one context, installs the transport
//! callbacks and runs the router. Application calls go straight to the
//! manager that owns the entity; the facade adds the engine-wide pieces
//! (subscriptions, devices, shutdown) and shortcuts for the common paths.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{DeviceEvent, EngineEvent, EventCategory, SubscriptionId, UpdateType};
use crate::media::{
    AudioDeviceType, AudioOutput, Canvas, Capability, DeviceInfo, DeviceProvider, NoDevices,
    NullRenderer, VideoRenderer,
};
use crate::media_player::{MediaPlayerHandle, MediaPlayerManager, MediaSource, NoMediaSource};
use crate::mixer::MixerOrchestrator;
use crate::player::{PlayerConfig, PlayerManager};
use crate::publisher::{PublishChannel, PublisherManager};
use crate::room::{RoomConfig, RoomManager, User};
use crate::transport::Transport;

use super::config::EngineConfig;
use super::context::EngineContext;
use super::router::{self, Router};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    renderer: Arc<dyn VideoRenderer>,
    audio_output: Arc<dyn AudioOutput>,
    media_source: Arc<dyn MediaSource>,
    devices: Arc<dyn DeviceProvider>,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: EngineConfig::default(),
            renderer: Arc::new(NullRenderer),
            audio_output: Arc::new(NullRenderer),
            media_source: Arc::new(NoMediaSource),
            devices: Arc::new(NoDevices),
            runtime: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn VideoRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn audio_output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.audio_output = output;
        self
    }

    pub fn media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = source;
        self
    }

    pub fn devices(mut self, devices: Arc<dyn DeviceProvider>) -> Self {
        self.devices = devices;
        self
    }

    /// Runtime for background tasks. Defaults to the runtime `build` is called on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|_| Error::InvalidState("engine built outside a tokio runtime".into()))?,
        };

        let ctx = Arc::new(EngineContext::new(
            self.config,
            self.transport,
            runtime,
            self.renderer,
            self.audio_output,
        ));

        let (room, signals) = RoomManager::new(ctx.clone());
        let publisher = PublisherManager::new(ctx.clone());
        let player = PlayerManager::new(ctx.clone());
        let mixer = MixerOrchestrator::new(ctx.clone());
        let media_players = MediaPlayerManager::new(ctx.clone(), self.media_source, publisher.clone());

        let inbound = router::install(ctx.transport.as_ref());
        let router = Router {
            room: room.clone(),
            publisher: publisher.clone(),
            player: player.clone(),
            mixer: mixer.clone(),
        };
        let router_task = ctx.spawn(router.run(inbound, signals));

        tracing::info!(
            media_players = ctx.config.media_player_capacity,
            quality_interval_ms = ctx.config.quality_interval.as_millis() as u64,
            "Engine started"
        );

        Ok(Engine {
            ctx,
            devices: self.devices,
            room,
            publisher,
            player,
            mixer,
            media_players,
            router_task,
        })
    }
}

/// Real-time media session engine
pub struct Engine {
    ctx: Arc<EngineContext>,
    devices: Arc<dyn DeviceProvider>,
    room: Arc<RoomManager>,
    publisher: Arc<PublisherManager>,
    player: Arc<PlayerManager>,
    mixer: Arc<MixerOrchestrator>,
    media_players: Arc<MediaPlayerManager>,
    router_task: JoinHandle<()>,
}

impl Engine {
    pub fn builder(transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder::new(transport)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.room
    }

    pub fn publisher(&self) -> &Arc<PublisherManager> {
        &self.publisher
    }

    pub fn player(&self) -> &Arc<PlayerManager> {
        &self.player
    }

    pub fn mixer(&self) -> &Arc<MixerOrchestrator> {
        &self.mixer
    }

    pub fn media_players(&self) -> &Arc<MediaPlayerManager> {
        &self.media_players
    }

    // Event subscriptions

    /// Receive every event in emission order
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<EngineEvent>) {
        self.ctx.events.subscribe()
    }

    pub fn subscribe_category(
        &self,
        category: EventCategory,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<EngineEvent>) {
        self.ctx.events.subscribe_category(category)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.ctx.events.unsubscribe(id)
    }

    // Shortcuts

    pub fn login_room(&self, room_id: &str, user: User, config: RoomConfig) -> Result<()> {
        self.room.join(room_id, user, config)
    }

    /// Leave a room, stopping every publish and play bound to it
    pub fn logout_room(&self, room_id: &str) {
        self.room.leave(room_id);
    }

    pub fn start_publishing(&self, stream_id: &str, channel: PublishChannel) -> Result<()> {
        self.publisher.start_publishing(stream_id, channel)
    }

    pub fn stop_publishing(&self, channel: PublishChannel) {
        self.publisher.stop_publishing(channel);
    }

    pub fn start_playing_stream(
        &self,
        stream_id: &str,
        canvas: Option<Canvas>,
        config: PlayerConfig,
    ) -> Result<()> {
        self.player.start_playing_stream(stream_id, canvas, config)
    }

    pub fn stop_playing_stream(&self, stream_id: &str) {
        self.player.stop_playing_stream(stream_id);
    }

    pub fn create_media_player(&self) -> Option<MediaPlayerHandle> {
        self.media_players.create_media_player()
    }

    pub fn destroy_media_player(&self, handle: MediaPlayerHandle) -> bool {
        self.media_players.destroy_media_player(handle)
    }

    // Devices

    pub fn audio_devices(&self, device_type: AudioDeviceType) -> Capability<Vec<DeviceInfo>> {
        self.devices.audio_devices(device_type)
    }

    pub fn video_devices(&self) -> Capability<Vec<DeviceInfo>> {
        self.devices.video_devices()
    }

    /// Report a capture or playout device failure. Stream states are untouched.
    pub fn report_device_error(&self, error_code: i32, device_name: &str) {
        tracing::warn!(device = %device_name, error_code, "Device error");
        self.ctx.emit(DeviceEvent::Error {
            error_code,
            device_name: device_name.to_string(),
        });
    }

    pub fn report_audio_device_change(
        &self,
        update_type: UpdateType,
        device_type: AudioDeviceType,
        device: DeviceInfo,
    ) {
        tracing::info!(update = ?update_type, device_type = ?device_type, device = %device.device_id, "Audio device changed");
        self.ctx.emit(DeviceEvent::AudioDeviceStateChanged {
            update_type,
            device_type,
            device,
        });
    }

    pub fn report_video_device_change(&self, update_type: UpdateType, device: DeviceInfo) {
        tracing::info!(update = ?update_type, device = %device.device_id, "Video device changed");
        self.ctx.emit(DeviceEvent::VideoDeviceStateChanged { update_type, device });
    }

    /// Stop everything and leave every room
    pub fn shutdown(&self) {
        self.media_players.destroy_all();
        self.mixer.stop_all();
        self.publisher.stop_all();
        self.player.stop_all();
        self.room.leave_all();
        tracing::info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.router_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::error::codes;
    use crate::event::{PublisherEvent, RoomEvent};
    use crate::publisher::PublisherState;
    use crate::room::{RoomState, StreamInfo};
    use crate::test_helpers::{init_tracing, next_event, settle, MockTransport};
    use crate::transport::mock::CONNECT;
    use crate::transport::{Connectivity, ServerPush, TransportErrorKind};

    fn engine(transport: &Arc<MockTransport>) -> Engine {
        init_tracing();
        Engine::builder(transport.clone())
            .config(EngineConfig::default().quality_interval(Duration::from_secs(3600)))
            .build()
            .unwrap()
    }

    async fn wait_for<F>(rx: &mut UnboundedReceiver<EngineEvent>, mut pred: F) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    fn room_state(state: RoomState) -> impl FnMut(&EngineEvent) -> bool {
        move |e| matches!(e, EngineEvent::Room(RoomEvent::StateUpdate { state: s, .. }) if *s == state)
    }

    fn publisher_state(state: PublisherState) -> impl FnMut(&EngineEvent) -> bool {
        move |e| {
            matches!(e, EngineEvent::Publisher(PublisherEvent::StateUpdate { state: s, .. }) if *s == state)
        }
    }

    async fn logged_in(engine: &Engine, events: &mut UnboundedReceiver<EngineEvent>) {
        engine
            .login_room("r1", User::new("me"), RoomConfig::default().user_status_notify(true))
            .unwrap();
        wait_for(events, room_state(RoomState::Connected)).await;
    }

    #[test]
    fn test_build_requires_runtime_or_handle() {
        let transport = MockTransport::new();
        assert!(matches!(
            Engine::builder(transport.clone()).build(),
            Err(Error::InvalidState(_))
        ));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let engine = Engine::builder(transport).runtime(runtime.handle().clone()).build();
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn test_user_update_precedes_stream_update() {
        let transport = MockTransport::new();
        let engine = engine(&transport);
        let (_, mut events) = engine.subscribe_category(EventCategory::Room);
        logged_in(&engine, &mut events).await;

        let u1 = User::new("u1");
        transport.push(ServerPush::UserUpdate {
            room_id: "r1".into(),
            update: UpdateType::Add,
            users: vec![u1.clone()],
        });
        transport.push(ServerPush::StreamUpdate {
            room_id: "r1".into(),
            update: UpdateType::Add,
            streams: vec![StreamInfo::new(u1.clone(), "s1")],
        });

        match next_event(&mut events).await {
            EngineEvent::Room(RoomEvent::UserUpdate {
                room_id,
                update_type,
                users,
            }) => {
                assert_eq!(room_id, "r1");
                assert_eq!(update_type, UpdateType::Add);
                assert_eq!(users, vec![u1]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::Room(RoomEvent::StreamUpdate { .. })
        ));
        assert_eq!(engine.rooms().streams("r1").len(), 1);
    }

    #[tokio::test]
    async fn test_logout_stops_publishing() {
        let transport = MockTransport::new();
        let engine = engine(&transport);
        let (_, mut events) = engine.subscribe();
        logged_in(&engine, &mut events).await;

        engine.start_publishing("s1", PublishChannel::Main).unwrap();
        wait_for(&mut events, publisher_state(PublisherState::Publishing)).await;

        engine.logout_room("r1");
        wait_for(&mut events, publisher_state(PublisherState::NoPublish)).await;
        assert_eq!(engine.publisher().state(PublishChannel::Main), PublisherState::NoPublish);

        // The stream id is free again for the next room
        logged_in(&engine, &mut events).await;
        engine.start_publishing("s1", PublishChannel::Aux).unwrap();
    }

    #[tokio::test]
    async fn test_connectivity_loss_reenters_requesting() {
        let transport = MockTransport::new();
        let engine = engine(&transport);
        let (_, mut events) = engine.subscribe();
        logged_in(&engine, &mut events).await;
        engine.start_publishing("s1", PublishChannel::Main).unwrap();
        wait_for(&mut events, publisher_state(PublisherState::Publishing)).await;

        // First reconnect attempt fails so the room stays connecting until the network is back
        transport.fail_next(CONNECT, 1, TransportErrorKind::Network);
        transport.set_connectivity(Connectivity::Lost);
        let event = wait_for(&mut events, publisher_state(PublisherState::PublishRequesting)).await;
        if let EngineEvent::Publisher(PublisherEvent::StateUpdate { error_code, .. }) = event {
            assert_eq!(error_code, codes::NETWORK_INTERRUPTED);
        }
        assert_eq!(engine.rooms().state("r1"), RoomState::Connecting);

        transport.set_connectivity(Connectivity::Connected);
        wait_for(&mut events, room_state(RoomState::Connected)).await;
        wait_for(&mut events, publisher_state(PublisherState::Publishing)).await;
    }

    #[tokio::test]
    async fn test_devices_unsupported_by_default() {
        let engine = engine(&MockTransport::new());
        assert!(!engine.video_devices().is_supported());
        assert!(!engine.audio_devices(AudioDeviceType::Input).is_supported());

        let (_, mut events) = engine.subscribe_category(EventCategory::Device);
        engine.report_device_error(1_000_001, "front camera");
        engine.report_video_device_change(UpdateType::Delete, DeviceInfo::new("cam0", "front camera"));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::Device(DeviceEvent::Error { error_code: 1_000_001, .. })
        ));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::Device(DeviceEvent::VideoDeviceStateChanged { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let transport = MockTransport::new();
        let engine = engine(&transport);
        let (id, mut events) = engine.subscribe();
        logged_in(&engine, &mut events).await;
        engine.start_publishing("s1", PublishChannel::Main).unwrap();
        engine
            .start_playing_stream("remote", None, PlayerConfig::default())
            .unwrap();
        let players: Vec<_> = (0..4).filter_map(|_| engine.create_media_player()).collect();
        assert_eq!(players.len(), 4);
        assert_eq!(engine.create_media_player(), None);

        engine.shutdown();
        settle().await;

        assert_eq!(engine.rooms().state("r1"), RoomState::Disconnected);
        assert_eq!(engine.publisher().state(PublishChannel::Main), PublisherState::NoPublish);
        assert_eq!(engine.media_players().live_count(), 0);
        assert!(engine.create_media_player().is_some());
        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));
    }
}
