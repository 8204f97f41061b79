use tokio::sync::broadcast;

use super::frame::Ack;
use super::status::MachineStatus;

/// Everything the link observes, delivered to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected { port: String },
    Disconnected,
    Status(MachineStatus),
    /// A `<...>` frame that failed to parse; the previous status stays in effect.
    StatusRejected { frame: String, reason: String },
    Setting { id: String, value: String },
    Log(String),
    Ack(Ack),
    Alarm(u16),
}

/// Tokio broadcast based event bus. Publishing never blocks; slow subscribers
/// observe `RecvError::Lagged` instead of stalling the publisher.
#[derive(Debug)]
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver `event` to the current subscribers. Returns how many received it.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.publish(LinkEvent::Log("Grbl 1.1h".to_string())), 2);
        assert_eq!(a.recv().await.unwrap(), LinkEvent::Log("Grbl 1.1h".to_string()));
        assert_eq!(b.recv().await.unwrap(), LinkEvent::Log("Grbl 1.1h".to_string()));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus: EventBus<LinkEvent> = EventBus::new(4);
        assert_eq!(bus.publish(LinkEvent::Disconnected), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
