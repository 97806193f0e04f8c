//! Event fan-out to whoever is listening
//!
//! Every mutation that changes an entity emits an [`IpcEvent`]. Emission
//! never blocks and never fails; with no subscribers the event is dropped.

use dh_core::ipc::IpcEvent;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 1024;

/// Cloneable handle to the event channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IpcEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event
    pub fn emit(&self, event: IpcEvent) {
        // Err only means nobody is subscribed
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpcEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dh_core::types::StackId;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(IpcEvent::StackRemoved {
            stack_id: StackId::new("s"),
        });

        let mut rx = bus.subscribe();
        bus.emit(IpcEvent::ProxyReloaded { domain_count: 2 });
        assert_eq!(
            rx.recv().await.unwrap(),
            IpcEvent::ProxyReloaded { domain_count: 2 }
        );
    }
}
