//! Transport collaborator interface
//!
//! The engine never opens sockets. It drives a [`Transport`] for control
//! requests and outbound media, and receives server pushes and connectivity
//! changes through callbacks registered once at engine construction.

pub mod error;
pub mod message;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;

use crate::publisher::PublishChannel;

pub use error::{TransportError, TransportErrorKind};
pub use message::{
    Connectivity, ControlMessage, ControlReply, MediaPacket, ServerPush, VideoEncodeParams,
};

/// Callback for connectivity changes
pub type ConnectivityCallback = Box<dyn Fn(Connectivity) + Send + Sync>;

/// Callback for server pushes
pub type PushCallback = Box<dyn Fn(ServerPush) + Send + Sync>;

/// Capability interface to the cloud edge and CDNs
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the signalling path for a room
    async fn connect(&self, room_id: &str) -> Result<(), TransportError>;

    /// Close the signalling path for a room
    async fn disconnect(&self, room_id: &str);

    /// Send a control request and wait for its reply
    async fn send_control(&self, message: ControlMessage) -> Result<ControlReply, TransportError>;

    /// Queue outbound media for a publish channel
    fn send_media(&self, channel: PublishChannel, packet: MediaPacket) -> Result<(), TransportError>;

    fn on_connectivity_change(&self, callback: ConnectivityCallback);

    fn on_server_push(&self, callback: PushCallback);
}
