//! Per-invocation event bus.
//!
//! Every handler invocation gets a fresh [`EventBus`]. Events published to it
//! are collected in order; once the handler returns, the engine drains the bus
//! and dispatches each event depth-first before moving on.
//!
//! # Guarantees
//!
//! - **Ordered**: events are dispatched in the order they were published
//! - **Scoped**: a bus never outlives the invocation that owns it
//! - **Discarded on failure**: if the handler fails, nothing it published is dispatched

use std::sync::Mutex;

use crate::core::{Message, MessageEnvelope};
use crate::stream::MessageStream;

/// Collects the events published by one handler invocation.
#[derive(Default)]
pub struct EventBus {
    published: Mutex<Vec<MessageEnvelope>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event. It is dispatched after the current handler returns.
    pub fn publish<E: Message>(&self, event: E) {
        self.publish_envelope(MessageEnvelope::event(event));
    }

    /// Publish an already wrapped event.
    pub fn publish_envelope(&self, envelope: MessageEnvelope) {
        self.lock().push(envelope);
    }

    /// Number of events published so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take everything published so far, leaving the bus empty.
    pub fn drain(&self) -> MessageStream {
        MessageStream::from_envelopes(std::mem::take(&mut *self.lock()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MessageEnvelope>> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("published", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageKind;

    #[derive(Debug, Clone)]
    struct OrderPlaced {
        id: u32,
    }

    #[derive(Debug, Clone)]
    struct StockReserved;

    #[test]
    fn test_publish_preserves_order() {
        let bus = EventBus::new();
        bus.publish(OrderPlaced { id: 1 });
        bus.publish(StockReserved);
        bus.publish(OrderPlaced { id: 2 });

        assert_eq!(bus.len(), 3);
        let stream = bus.drain();
        assert_eq!(
            stream.type_names(),
            vec!["OrderPlaced", "StockReserved", "OrderPlaced"]
        );
        let ids: Vec<_> = stream.of_type::<OrderPlaced>().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_published_messages_are_events() {
        let bus = EventBus::new();
        bus.publish(StockReserved);

        let stream = bus.drain();
        assert!(stream.iter().all(|m| m.kind() == MessageKind::Event));
    }

    #[test]
    fn test_drain_empties_bus() {
        let bus = EventBus::new();
        bus.publish(StockReserved);

        assert_eq!(bus.drain().len(), 1);
        assert!(bus.is_empty());
        assert!(bus.drain().is_empty());
    }
}
