//! Process-wide event hub.
//!
//! Every canonical event the service emits is published here so that
//! observers that did not start a run (the `/events` feed, other windows)
//! still see it.

use log::trace;
use tokio::sync::broadcast;

use tandem_protocol::ServerEvent;

/// Size of the broadcast channel for events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Broadcast hub for canonical server events.
#[derive(Debug, Clone)]
pub struct EventHub {
    event_tx: broadcast::Sender<ServerEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { event_tx }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: ServerEvent) {
        if let Err(e) = self.event_tx.send(event) {
            trace!("No hub subscribers for event: {:?}", e.0.session_id());
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
