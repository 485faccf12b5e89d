//! Event fan-out to subscribers
//!
//! Every emit happens under one lock, so all subscribers observe the same
//! global order and a batch is never interleaved with another emit.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::types::{EngineEvent, EventCategory};

/// Identifies a subscription for [`EventDispatcher::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    filter: Option<EventCategory>,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl Subscriber {
    fn wants(&self, event: &EngineEvent) -> bool {
        self.filter.map_or(true, |c| c == event.category())
    }
}

struct DispatcherInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Single event sink shared by every manager
pub struct EventDispatcher {
    inner: Mutex<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DispatcherInner {
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Receive every event
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<EngineEvent>) {
        self.add_subscriber(None)
    }

    /// Receive only the events of one category
    pub fn subscribe_category(
        &self,
        category: EventCategory,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<EngineEvent>) {
        self.add_subscriber(Some(category))
    }

    fn add_subscriber(
        &self,
        filter: Option<EventCategory>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, filter, tx });

        tracing::debug!(subscription = id.0, filter = ?filter, "Event subscriber added");
        (id, rx)
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        before != inner.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn emit(&self, event: impl Into<EngineEvent>) {
        let event = event.into();
        let mut inner = self.inner.lock();
        deliver(&mut inner, event);
    }

    /// Emit several events back to back with no other event in between
    pub fn emit_batch(&self, events: Vec<EngineEvent>) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for event in events {
            deliver(&mut inner, event);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(inner: &mut DispatcherInner, event: EngineEvent) {
    // Receivers that were dropped without unsubscribing are pruned here.
    inner
        .subscribers
        .retain(|s| !s.wants(&event) || s.tx.send(event.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeviceEvent, RoomEvent};
    use crate::room::RoomState;

    fn room_state(room_id: &str) -> EngineEvent {
        EngineEvent::Room(RoomEvent::StateUpdate {
            room_id: room_id.into(),
            state: RoomState::Connecting,
            error_code: 0,
            extended_data: Default::default(),
        })
    }

    fn device_error() -> EngineEvent {
        EngineEvent::Device(DeviceEvent::Error {
            error_code: 1,
            device_name: "cam".into(),
        })
    }

    #[test]
    fn test_fan_out_and_filter() {
        let dispatcher = EventDispatcher::new();
        let (_, mut all) = dispatcher.subscribe();
        let (_, mut rooms) = dispatcher.subscribe_category(EventCategory::Room);

        dispatcher.emit(room_state("r1"));
        dispatcher.emit(device_error());

        assert_eq!(all.try_recv().ok(), Some(room_state("r1")));
        assert_eq!(all.try_recv().ok(), Some(device_error()));
        assert_eq!(rooms.try_recv().ok(), Some(room_state("r1")));
        assert!(rooms.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let (id, mut rx) = dispatcher.subscribe();

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.emit(room_state("r1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let dispatcher = EventDispatcher::new();
        let (_, rx) = dispatcher.subscribe();
        drop(rx);

        dispatcher.emit(room_state("r1"));
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn test_batch_is_contiguous() {
        let dispatcher = std::sync::Arc::new(EventDispatcher::new());
        let (_, mut rx) = dispatcher.subscribe();

        let writer = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    dispatcher.emit(room_state("r2"));
                }
            })
        };
        for _ in 0..20 {
            dispatcher.emit_batch(vec![room_state("r1"), room_state("r1"), room_state("r1")]);
        }
        writer.join().unwrap();

        let mut received = Vec::new();
        while let Ok(EngineEvent::Room(event)) = rx.try_recv() {
            received.push(event.room_id().to_string());
        }
        assert_eq!(received.len(), 160);

        // Every run of r1 events has a length that is a multiple of the batch size
        let end = "end".to_string();
        let mut run = 0;
        for room in received.iter().chain(std::iter::once(&end)) {
            if room == "r1" {
                run += 1;
            } else {
                assert_eq!(run % 3, 0);
                run = 0;
            }
        }
    }
}
