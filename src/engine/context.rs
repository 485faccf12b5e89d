//! Shared engine context
//!
//! Every manager holds an `Arc<EngineContext>` with the collaborators and
//! process-wide tables it needs.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::event::{EngineEvent, EventDispatcher};
use crate::media::{
    AudioOutput, Bindings, Canvas, DeviceKind, RenderOwner, SurfaceId, VideoFrame, VideoRenderer,
};
use crate::publisher::PublishChannel;
use crate::registry::SessionRegistry;
use crate::transport::Transport;

use super::config::EngineConfig;

/// Capture device key: kind plus platform device id
pub type CaptureDevice = (DeviceKind, String);

/// Capture device owner: a channel holds at most one device of each kind
pub type CaptureOwner = (DeviceKind, PublishChannel);

pub(crate) struct EngineContext {
    /// Engine configuration
    pub config: EngineConfig,

    /// Network collaborator
    pub transport: Arc<dyn Transport>,

    /// Event sink
    pub events: EventDispatcher,

    /// Rooms, publish claims and play streams
    pub registry: SessionRegistry,

    /// Runtime all background tasks are spawned on
    pub runtime: Handle,

    /// Render collaborator
    pub renderer: Arc<dyn VideoRenderer>,

    /// Local playout collaborator
    pub audio_output: Arc<dyn AudioOutput>,

    /// Render surface ownership
    pub surfaces: Bindings<SurfaceId, RenderOwner>,

    /// Capture device ownership
    pub capture_devices: Bindings<CaptureDevice, CaptureOwner>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        runtime: Handle,
        renderer: Arc<dyn VideoRenderer>,
        audio_output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            config,
            transport,
            events: EventDispatcher::new(),
            registry: SessionRegistry::new(),
            runtime,
            renderer,
            audio_output,
            surfaces: Bindings::new(),
            capture_devices: Bindings::new(),
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future)
    }

    pub fn emit(&self, event: impl Into<EngineEvent>) {
        self.events.emit(event);
    }

    /// Bind a canvas to `owner`, clearing any surface the owner leaves
    pub fn bind_canvas(&self, canvas: &Canvas, owner: RenderOwner) {
        let rebind = self.surfaces.bind(canvas.surface, owner.clone());
        if let Some(displaced) = rebind.displaced_owner {
            tracing::debug!(surface = canvas.surface, from = ?displaced, to = ?owner, "Surface rebound");
        }
        if let Some(previous) = rebind.released_resource {
            self.renderer.clear(previous);
        }
    }

    /// Release the surface held by `owner`
    pub fn release_canvas(&self, owner: &RenderOwner) {
        if let Some(surface) = self.surfaces.release_owner(owner) {
            self.renderer.clear(surface);
        }
    }

    /// Draw a frame if `owner` still holds the canvas surface
    pub fn render(&self, canvas: &Canvas, owner: &RenderOwner, frame: &VideoFrame, mirror: bool) -> bool {
        if self.surfaces.owner_of(&canvas.surface).as_ref() != Some(owner) {
            return false;
        }
        self.renderer.render(canvas, frame, mirror);
        true
    }
}

#[cfg(test)]
impl EngineContext {
    /// Context over a mock transport on the current runtime
    pub fn for_test(
        transport: Arc<crate::transport::mock::MockTransport>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Self::for_test_with_renderer(
            transport,
            config,
            crate::transport::mock::RecordingRenderer::new(),
        )
    }

    pub fn for_test_with_renderer(
        transport: Arc<crate::transport::mock::MockTransport>,
        config: EngineConfig,
        renderer: Arc<crate::transport::mock::RecordingRenderer>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            config,
            transport,
            Handle::current(),
            renderer.clone(),
            renderer,
        ))
    }
}
