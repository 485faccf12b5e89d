//! Inbound routing
//!
//! Transport callbacks only enqueue. A single router task drains the queue
//! and hands each server push to the first manager that claims it, so pushes
//! are applied in the order the transport delivered them. Room lifecycle
//! signals are forwarded to the publisher and player from the same task.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::mixer::MixerOrchestrator;
use crate::player::PlayerManager;
use crate::publisher::PublisherManager;
use crate::room::{RoomManager, RoomSignal};
use crate::transport::{Connectivity, ServerPush, Transport};

/// Something the transport told the engine
#[derive(Debug)]
pub(crate) enum Inbound {
    Push(ServerPush),
    Connectivity(Connectivity),
}

/// Register the transport callbacks, returning the queue they feed
pub(crate) fn install(transport: &dyn Transport) -> mpsc::UnboundedReceiver<Inbound> {
    let (tx, rx) = mpsc::unbounded_channel();

    let push_tx = tx.clone();
    transport.on_server_push(Box::new(move |push| {
        let _ = push_tx.send(Inbound::Push(push));
    }));
    transport.on_connectivity_change(Box::new(move |connectivity| {
        let _ = tx.send(Inbound::Connectivity(connectivity));
    }));

    rx
}

pub(crate) struct Router {
    pub room: Arc<RoomManager>,
    pub publisher: Arc<PublisherManager>,
    pub player: Arc<PlayerManager>,
    pub mixer: Arc<MixerOrchestrator>,
}

impl Router {
    pub async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut signals: mpsc::UnboundedReceiver<RoomSignal>,
    ) {
        loop {
            tokio::select! {
                Some(message) = inbound.recv() => match message {
                    Inbound::Push(push) => self.route_push(push),
                    Inbound::Connectivity(connectivity) => {
                        tracing::info!(connectivity = ?connectivity, "Connectivity changed");
                        self.room.on_connectivity(connectivity);
                    }
                },
                Some(signal) = signals.recv() => {
                    tracing::debug!(signal = ?signal, "Room signal");
                    self.publisher.on_room_signal(&signal);
                    self.player.on_room_signal(&signal);
                }
                else => break,
            }
        }
        tracing::debug!("Router stopped");
    }

    fn route_push(&self, push: ServerPush) {
        let handled = self.room.handle_push(&push)
            || self.publisher.handle_push(&push)
            || self.player.handle_push(&push)
            || self.mixer.handle_push(&push);

        if !handled {
            tracing::warn!(push = ?push, "Server push not handled");
        }
    }
}
