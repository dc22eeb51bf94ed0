use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Max events buffered per subscriber before it starts lagging.
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Published once per completed execution attempt. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub job_name: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
}

/// In-process fan-out of completion events.
///
/// Each subscriber gets every event published after it subscribed.
/// Dropping the receiver unsubscribes.
#[derive(Clone)]
pub struct CompletionBus {
    tx: broadcast::Sender<CompletionEvent>,
}

impl CompletionBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.tx.subscribe()
    }

    /// Publish to the current subscribers. No subscribers is not an error.
    pub fn publish(&self, event: CompletionEvent) {
        let job = event.job_name.clone();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(job = %job, subscribers = delivered, "completion published");
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CompletionBus {
    fn default() -> Self {
        Self::new()
    }
}
