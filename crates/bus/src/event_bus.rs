//! Bounded pub/sub event bus
//!
//! Built on `tokio::sync::broadcast`. Each subscriber has its own bounded
//! queue; on overflow the oldest events are discarded and counted. The
//! drop counter is exposed for the observability surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use trustplane_core::Event;

/// Event bus for distributing core events to subscribers
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new bus with the given per-subscriber queue bound
    pub fn new(queue_size: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(queue_size.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            inner: self.sender.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Publish an event to all current subscribers
    ///
    /// Returns the number of subscribers that will observe the event.
    /// Publishing never blocks; with no subscribers the event is discarded.
    pub fn publish(&self, event: Event) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    /// Total events discarded across all lagging subscribers
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Count of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side of the bus; counts overflow losses
pub struct BusReceiver {
    inner: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl BusReceiver {
    /// Receive the next event, skipping over any overflow gap
    ///
    /// Returns `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(dropped = n, "subscriber lagged; oldest events discarded");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when no event is ready
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}
