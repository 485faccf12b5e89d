//! Scripted in-memory transport for tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::media::{AudioFrame, AudioOutput, Canvas, SurfaceId, VideoFrame, VideoRenderer};
use crate::publisher::PublishChannel;
use crate::room::RoomSnapshot;

use super::{
    Connectivity, ConnectivityCallback, ControlMessage, ControlReply, MediaPacket, PushCallback,
    ServerPush, Transport, TransportError, TransportErrorKind,
};

/// Name used to script failures of `connect`
pub const CONNECT: &str = "connect";

#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<ControlMessage>>,
    media: Mutex<Vec<(PublishChannel, MediaPacket)>>,
    failures: Mutex<HashMap<&'static str, VecDeque<TransportErrorKind>>>,
    holds: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    snapshot: Mutex<RoomSnapshot>,
    layered: AtomicBool,
    push_callback: Mutex<Option<PushCallback>>,
    connectivity_callback: Mutex<Option<ConnectivityCallback>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` requests named `name` with `kind`
    pub fn fail_next(&self, name: &'static str, count: usize, kind: TransportErrorKind) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(name).or_default();
        queue.extend(std::iter::repeat(kind).take(count));
    }

    /// Block requests named `name` until [`MockTransport::release`]
    pub fn hold(&self, name: &'static str) {
        self.holds.lock().insert(name, Arc::new(Semaphore::new(0)));
    }

    /// Let one held request through
    pub fn release(&self, name: &'static str) {
        if let Some(gate) = self.holds.lock().get(name) {
            gate.add_permits(1);
        }
    }

    pub fn set_login_snapshot(&self, snapshot: RoomSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn set_layered(&self, layered: bool) {
        self.layered.store(layered, Ordering::SeqCst);
    }

    /// Deliver a server push to the engine
    pub fn push(&self, push: ServerPush) {
        if let Some(callback) = self.push_callback.lock().as_ref() {
            callback(push);
        }
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        if let Some(callback) = self.connectivity_callback.lock().as_ref() {
            callback(connectivity);
        }
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().clone()
    }

    /// Number of control requests named `name`
    pub fn count(&self, name: &str) -> usize {
        self.sent.lock().iter().filter(|m| m.name() == name).count()
    }

    pub fn media(&self) -> Vec<(PublishChannel, MediaPacket)> {
        self.media.lock().clone()
    }

    pub fn video_packets(&self, channel: PublishChannel) -> usize {
        self.media
            .lock()
            .iter()
            .filter(|(c, p)| *c == channel && matches!(p, MediaPacket::Video { .. }))
            .count()
    }

    pub fn audio_packets(&self, channel: PublishChannel) -> usize {
        self.media
            .lock()
            .iter()
            .filter(|(c, p)| *c == channel && matches!(p, MediaPacket::Audio { .. }))
            .count()
    }

    pub fn clear_media(&self) {
        self.media.lock().clear();
    }

    fn take_failure(&self, name: &'static str) -> Option<TransportError> {
        let kind = self.failures.lock().get_mut(name)?.pop_front()?;
        Some(TransportError::new(kind, format!("scripted {} failure", name)))
    }

    async fn wait_gate(&self, name: &'static str) {
        let gate = self.holds.lock().get(name).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _room_id: &str) -> Result<(), TransportError> {
        match self.take_failure(CONNECT) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, _room_id: &str) {}

    async fn send_control(&self, message: ControlMessage) -> Result<ControlReply, TransportError> {
        let name = message.name();
        self.sent.lock().push(message.clone());
        self.wait_gate(name).await;

        if let Some(err) = self.take_failure(name) {
            return Err(err);
        }

        Ok(match message {
            ControlMessage::Login { .. } => ControlReply::LoggedIn(self.snapshot.lock().clone()),
            ControlMessage::StartPlay { .. } => ControlReply::PlayAccepted {
                layered: self.layered.load(Ordering::SeqCst),
            },
            _ => ControlReply::Ack,
        })
    }

    fn send_media(&self, channel: PublishChannel, packet: MediaPacket) -> Result<(), TransportError> {
        self.media.lock().push((channel, packet));
        Ok(())
    }

    fn on_connectivity_change(&self, callback: ConnectivityCallback) {
        *self.connectivity_callback.lock() = Some(callback);
    }

    fn on_server_push(&self, callback: PushCallback) {
        *self.push_callback.lock() = Some(callback);
    }
}

/// Renderer and audio output that count what they receive
#[derive(Default)]
pub struct RecordingRenderer {
    rendered: Mutex<Vec<(SurfaceId, bool)>>,
    cleared: Mutex<Vec<SurfaceId>>,
    played: Mutex<Vec<u8>>,
}

impl RecordingRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames drawn into `surface`
    pub fn rendered_on(&self, surface: SurfaceId) -> usize {
        self.rendered.lock().iter().filter(|(s, _)| *s == surface).count()
    }

    /// Mirror flag of the last frame drawn
    pub fn last_mirror(&self) -> Option<bool> {
        self.rendered.lock().last().map(|(_, mirror)| *mirror)
    }

    pub fn cleared(&self) -> Vec<SurfaceId> {
        self.cleared.lock().clone()
    }

    /// Volumes of every played audio frame
    pub fn played(&self) -> Vec<u8> {
        self.played.lock().clone()
    }
}

impl VideoRenderer for RecordingRenderer {
    fn render(&self, canvas: &Canvas, _frame: &VideoFrame, mirror: bool) {
        self.rendered.lock().push((canvas.surface, mirror));
    }

    fn clear(&self, surface: SurfaceId) {
        self.cleared.lock().push(surface);
    }
}

impl AudioOutput for RecordingRenderer {
    fn play(&self, _frame: &AudioFrame, volume: u8) {
        self.played.lock().push(volume);
    }
}
