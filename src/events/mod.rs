//! Event system for port lifecycle notifications
//!
//! The connect path is asynchronous: `connect` returns before the modem
//! channel is open. The event bus is how the composition layer learns
//! that a port became active, or that opening its channel failed.

pub mod types;

pub use types::RelayEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus for broadcasting relay events
///
/// The event bus uses tokio's broadcast channel to distribute events
/// to multiple subscribers. Publishing never blocks, so it is safe from
/// work items and completion handlers alike.
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives a `Lagged` error
    /// and misses some events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(RelayEvent::PortConnected { port: 0 });

        let event = rx.recv().await.unwrap();
        assert_eq!(event, RelayEvent::PortConnected { port: 0 });
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(RelayEvent::StatsReset);

        assert_eq!(rx1.recv().await.unwrap(), RelayEvent::StatsReset);
        assert_eq!(rx2.recv().await.unwrap(), RelayEvent::StatsReset);
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(RelayEvent::PortDisconnected { port: 0 });
    }
}
