//! In-memory fan-out bus for scheduler events.
//!
//! Built on a tokio broadcast channel: publishing never blocks the control
//! loop, and a subscriber that falls behind loses the oldest events rather
//! than stalling everyone else.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::SchedulerEvent;

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub active_subscribers: usize,
}

/// Cloneable publisher for scheduler events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to all current subscribers. Returns how many received it.
    pub fn publish(&self, event: SchedulerEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream. Lagged gaps are logged and skipped; the stream
    /// ends when the bus is dropped.
    pub fn stream(&self) -> impl Stream<Item = SchedulerEvent> + Send + 'static {
        stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("event_subscriber_lagged: skipped={}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.published.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
        }
    }
}
