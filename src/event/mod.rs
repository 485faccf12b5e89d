//! Event delivery
//!
//! Managers report state transitions as tagged [`EngineEvent`]s through a
//! single [`EventDispatcher`]. Applications subscribe to every event or to
//! one [`EventCategory`], and receive them on an unbounded channel in the
//! order they were emitted.

pub mod dispatcher;
pub mod types;

pub use dispatcher::{EventDispatcher, SubscriptionId};
pub use types::{
    DeviceEvent, EngineEvent, EventCategory, ExtendedData, MediaPlayerEvent, MixerEvent,
    PlayerEvent, PublisherEvent, RoomEvent, UpdateType,
};
