//! Change notifications published by the registries

use tokio::sync::broadcast;

/// Something observable changed in a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Any row of the form registry changed
    FormsChanged,
    /// The "newest form per identifier" view may differ
    LatestFormsChanged,
    /// An instance row changed
    InstanceChanged { id: i64 },
}

/// Fan-out of registry events to any number of listeners.
///
/// Publishing never blocks and never fails; slow listeners miss events
/// rather than stall a registry write.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RegistryEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
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

    #[test]
    fn test_publish_without_listeners_is_fine() {
        EventBus::new().publish(RegistryEvent::FormsChanged);
    }

    #[test]
    fn test_listener_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RegistryEvent::FormsChanged);
        bus.publish(RegistryEvent::LatestFormsChanged);
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::FormsChanged);
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::LatestFormsChanged);
    }
}
