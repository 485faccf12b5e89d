//! Session registry
//!
//! The registry is the process-wide table of active rooms, publish claims and
//! play streams. Application calls and server pushes consult it to find the
//! manager and entity they belong to.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SessionRegistry>
//!                   ┌──────────────────────────┐
//!                   │ rooms: [(id, state)]     │
//!                   │ publishers: {stream →    │
//!                   │   channel, room}         │
//!                   │ players: {stream → room} │
//!                   └────────────┬─────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//!   [RoomManager]       [PublisherManager]        [PlayerManager]
//!   set_room_state()    claim_stream()            register_play()
//!                       first_active_room()       register_play()
//! ```
//!
//! # Stream id uniqueness
//!
//! A stream id can be claimed by at most one publish channel at a time. The
//! claim is taken before the channel enters `PublishRequesting` and released
//! when it returns to `NoPublish`.

pub mod error;
pub mod store;

pub use error::RegistryError;
pub use store::{PublishClaim, SessionRegistry};
