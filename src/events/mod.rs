//! Event fan-out for call state and decoded video
//!
//! Subscribers each get their own broadcast receiver. Delivery order across
//! subscribers is unspecified and a lagging subscriber only loses its own
//! backlog; it never blocks the publisher or other subscribers.

pub mod types;

pub use types::CallEvent;

use tokio::sync::broadcast;

use crate::video::RemoteVideoFrame;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Decoded frames are large; keep only a few in flight per subscriber
const FRAME_CHANNEL_CAPACITY: usize = 8;

pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
    frames: broadcast::Sender<RemoteVideoFrame>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (frames, _rx) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self { tx, frames }
    }

    /// Publish an event to all subscribers
    ///
    /// With no active subscribers the event is dropped.
    pub fn publish(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Hand a decoded remote frame to the UI
    pub fn publish_frame(&self, frame: RemoteVideoFrame) {
        let _ = self.frames.send(frame);
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<RemoteVideoFrame> {
        self.frames.subscribe()
    }

    /// Sender for decoded frames, for tasks that outlive a borrow of the bus
    pub fn frame_sender(&self) -> broadcast::Sender<RemoteVideoFrame> {
        self.frames.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StreamKind;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(CallEvent::ParticipantAdded {
            user_id: "u1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CallEvent::ParticipantAdded { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(CallEvent::StreamStarted {
            user_id: "u1".to_string(),
            kind: StreamKind::Camera,
        });

        assert_eq!(rx1.recv().await.unwrap(), rx2.recv().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        drop(rx1);

        bus.publish(CallEvent::ParticipantRemoved {
            user_id: "u1".to_string(),
        });
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn test_recv_wakes_on_publish() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(recv.poll());

        bus.publish(CallEvent::ParticipantAdded {
            user_id: "u2".to_string(),
        });
        assert!(recv.is_woken());
        let event = tokio_test::assert_ready_ok!(recv.poll());
        assert!(matches!(event, CallEvent::ParticipantAdded { user_id } if user_id == "u2"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(CallEvent::ParticipantAdded {
            user_id: "nobody".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
