use crate::domain::events::EngineEvent;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

/// In-process bus for engine events. External collaborators (HTTP/WS shell)
/// subscribe and consume; slow subscribers lag rather than block publishers.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Events published with no
    /// subscribers are dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (for tests).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(EngineEvent::PortfolioDeleted { id: "p1".into() });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                EngineEvent::PortfolioDeleted { id } => assert_eq!(id, "p1"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn clone_shares_subscribers() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();

        let mut rx = bus1.subscribe();
        bus2.publish(EngineEvent::PortfolioDeleted { id: "p2".into() });

        assert_eq!(rx.recv().await.unwrap().portfolio_id(), "p2");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::PortfolioDeleted { id: "p3".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
