//! Client-side real-time media session engine
//!
//! The engine keeps the control plane of a live-streaming client: room
//! membership and reconnection, publishing on two channels with adaptive
//! traffic control and CDN relays, playing remote streams, server-side
//! mixer tasks, and a pool of local media players.
//!
//! Encoding, decoding, sockets and device drivers live outside the crate.
//! The engine reaches them through the [`Transport`](transport::Transport),
//! [`VideoRenderer`](media::VideoRenderer), [`AudioOutput`](media::AudioOutput),
//! [`MediaSource`](media_player::MediaSource) and
//! [`DeviceProvider`](media::DeviceProvider) collaborators, and reports
//! everything it does as [`EngineEvent`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use media_session::publisher::PublishChannel;
//! use media_session::room::{RoomConfig, User};
//! use media_session::transport::Transport;
//! use media_session::Engine;
//!
//! async fn run(transport: Arc<dyn Transport>) -> media_session::Result<()> {
//!     let engine = Engine::builder(transport).build()?;
//!     let (_, mut events) = engine.subscribe();
//!
//!     engine.login_room("room-1", User::new("alice"), RoomConfig::default())?;
//!     engine.start_publishing("alice-main", PublishChannel::Main)?;
//!
//!     while let Some(event) = events.recv().await {
//!         tracing::info!(event = ?event, "Engine event");
//!     }
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod engine;
pub mod error;
pub mod event;
pub mod media;
pub mod media_player;
pub mod mixer;
pub mod player;
pub mod publisher;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod room;
pub mod stats;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use completion::Completion;
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{Error, Result};
pub use event::{EngineEvent, EventCategory};
