use tokio::sync::broadcast;
use tracing::debug;

use loom_core::events::AgentEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out handle for lifecycle events. Clones share one channel, so a parent
/// and its sub-agents publish into the same stream.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            debug!(
                event_type = event.event_type(),
                session_id = %event.session_id(),
                "no event receivers"
            );
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
