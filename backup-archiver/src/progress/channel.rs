//! Forwards pipeline events to a broadcast channel for embedding callers.

use super::{PipelineEvent, ProgressObserver};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct ChannelObserver {
    tx: broadcast::Sender<PipelineEvent>,
}

impl ChannelObserver {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_event(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        // Having no subscribers is not a failure
        if let Ok(count) = self.tx.send(event.clone()) {
            debug!("Forwarded event to {} subscriber(s)", count);
        }
        Ok(())
    }
}
