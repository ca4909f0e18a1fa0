//! Bounded single-producer/single-consumer write buffer
//!
//! Backed by a lock-free `ArrayQueue`. A queue built with capacity `n` holds
//! at most `n - 1` entries, like a ring that keeps one slot free to tell
//! "full" from "empty". The producer and consumer halves are separate owned
//! values, which keeps the single-writer/single-reader contract in the types.

use crate::store::IndexedStore;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A buffered `(key, value)` write
pub type WriteEntry = (String, String);

pub struct PendingWriteQueue;

impl PendingWriteQueue {
    /// Create a queue and return its two halves. Capacity is clamped to 2.
    pub fn with_capacity<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
        let slots = Arc::new(ArrayQueue::new(capacity.max(2) - 1));
        (
            Producer {
                slots: Arc::clone(&slots),
            },
            Consumer { slots },
        )
    }
}

/// Writing half of a [`PendingWriteQueue`]
pub struct Producer<T> {
    slots: Arc<ArrayQueue<T>>,
}

impl<T> Producer<T> {
    /// Append an item without blocking; hands the item back when full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        self.slots.push(item)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Reading half of a [`PendingWriteQueue`]
pub struct Consumer<T> {
    slots: Arc<ArrayQueue<T>>,
}

impl<T> Consumer<T> {
    /// Take the oldest item, or `None` when empty
    pub fn dequeue(&mut self) -> Option<T> {
        self.slots.pop()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Drain buffered writes into `store`, sleeping `poll_interval` whenever the
/// queue is empty. Remaining entries are applied before the task exits on
/// shutdown.
pub fn spawn_write_applier(
    mut consumer: Consumer<WriteEntry>,
    store: IndexedStore,
    poll_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            apply_pending(&mut consumer, &store).await;
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        apply_pending(&mut consumer, &store).await;
        info!("write applier stopped");
    })
}

async fn apply_pending(consumer: &mut Consumer<WriteEntry>, store: &IndexedStore) {
    while let Some((key, value)) = consumer.dequeue() {
        debug!(%key, "applying buffered write");
        store.put(key, value).await;
    }
}
