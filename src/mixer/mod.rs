//! Server-side stream mixing
//!
//! A [`MixerTask`] describes inputs, layout and outputs. The
//! [`MixerOrchestrator`] validates it, starts it on the server and applies
//! updates while it runs.

pub mod orchestrator;
pub mod task;
pub mod validate;

pub use orchestrator::MixerOrchestrator;
pub use task::{
    MixerAudioConfig, MixerInput, MixerInputContentType, MixerOutput, MixerTask, MixerVideoConfig,
};
pub use validate::{check_frozen, validate_task};
