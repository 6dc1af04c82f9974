//! Event bus for connection lifecycle notifications
//!
//! Any number of subscribers (a UI, a log sink, tests) can observe what the
//! connection manager does without registering callbacks on it.

pub mod types;

pub use types::BridgeEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`BridgeEvent`]s
///
/// # Example
///
/// ```no_run
/// use webrtc_bridge::events::{BridgeEvent, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(BridgeEvent::ConnectionRemoved { id: "c1".to_string() });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}: {}", event.event_name(), event.connection_id());
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls more than the channel capacity behind receives
    /// `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
