//! Render targets and the render/playback collaborators

use serde::{Deserialize, Serialize};

use super::frame::{AudioFrame, VideoFrame};

/// Opaque identifier of a platform view the renderer draws into
pub type SurfaceId = u64;

/// How a frame is fitted into the view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ViewMode {
    /// Scale proportionally, may letterbox
    #[default]
    AspectFit,
    /// Scale proportionally to fill, may crop
    AspectFill,
    /// Stretch to fill
    ScaleToFill,
}

/// Which side of a publish sees a mirrored image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MirrorMode {
    /// Only the local preview is mirrored
    #[default]
    OnlyPreviewMirror,
    /// Preview and the published stream are mirrored
    BothMirror,
    /// Nothing is mirrored
    NoMirror,
    /// Only the published stream is mirrored
    OnlyPublishMirror,
}

impl MirrorMode {
    pub fn mirrors_preview(&self) -> bool {
        matches!(self, MirrorMode::OnlyPreviewMirror | MirrorMode::BothMirror)
    }

    pub fn mirrors_publish(&self) -> bool {
        matches!(self, MirrorMode::OnlyPublishMirror | MirrorMode::BothMirror)
    }
}

/// A view binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canvas {
    pub surface: SurfaceId,
    pub view_mode: ViewMode,
    /// 0xRRGGBB
    pub background_color: u32,
}

impl Canvas {
    /// Canvas with aspect-fit and a black background
    pub fn new(surface: SurfaceId) -> Self {
        Self {
            surface,
            view_mode: ViewMode::AspectFit,
            background_color: 0x000000,
        }
    }

    pub fn view_mode(mut self, mode: ViewMode) -> Self {
        self.view_mode = mode;
        self
    }
}

/// Render collaborator: draws frames into platform views
pub trait VideoRenderer: Send + Sync + 'static {
    fn render(&self, canvas: &Canvas, frame: &VideoFrame, mirror: bool);

    /// Called when a surface stops being fed by the engine
    fn clear(&self, _surface: SurfaceId) {}
}

/// Local audio output collaborator
pub trait AudioOutput: Send + Sync + 'static {
    fn play(&self, frame: &AudioFrame, volume: u8);
}

/// Renderer that drops everything, used when the host registers none
#[derive(Debug, Default)]
pub struct NullRenderer;

impl VideoRenderer for NullRenderer {
    fn render(&self, _canvas: &Canvas, _frame: &VideoFrame, _mirror: bool) {}
}

impl AudioOutput for NullRenderer {
    fn play(&self, _frame: &AudioFrame, _volume: u8) {}
}
