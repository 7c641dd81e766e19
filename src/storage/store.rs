use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::messaging::ssid::Ssid;

/// A message accepted for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub tenant: u32,
    pub ssid: Ssid,
    /// Seconds to keep the message; always positive.
    pub ttl: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected message: {0}")]
    Rejected(String),
    #[error("store queue is full")]
    QueueFull,
    #[error("store worker has stopped")]
    Closed,
}

/// Persistent message store owned by the surrounding service.
///
/// Called from the store worker task, one message at a time.
pub trait MessageStore: Send + Sync {
    fn store(&self, message: StoredMessage) -> Result<(), StoreError>;
}

/// Sending side of the store worker's bounded queue.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoredMessage>,
}

impl StoreHandle {
    /// Queue a message without waiting.
    pub fn submit(&self, message: StoredMessage) -> Result<(), StoreError> {
        self.tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => StoreError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => StoreError::Closed,
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct StoreWorker {
    store: Arc<dyn MessageStore>,
    rx: mpsc::Receiver<StoredMessage>,
}

impl StoreWorker {
    /// Create a worker with a queue of `depth` messages.
    pub fn new(store: Arc<dyn MessageStore>, depth: usize) -> (Self, StoreHandle) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { store, rx }, StoreHandle { tx })
    }

    /// Run on the current tokio runtime until shutdown is signalled or every
    /// handle is dropped. Messages already queued at shutdown are still stored.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("store worker started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = self.rx.recv() => match next {
                    Some(message) => self.persist(message),
                    None => {
                        tracing::debug!("store worker stopped: all handles dropped");
                        return;
                    }
                },
            }
        }
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(message) = self.rx.try_recv() {
            self.persist(message);
            drained += 1;
        }
        tracing::debug!(drained, "store worker stopped");
    }

    fn persist(&self, message: StoredMessage) {
        let tenant = message.tenant;
        let ttl = message.ttl;
        if let Err(err) = self.store.store(message) {
            tracing::warn!(tenant, ttl, "message store failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        stored: Mutex<Vec<StoredMessage>>,
        fail: bool,
    }

    impl MessageStore for MemoryStore {
        fn store(&self, message: StoredMessage) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Unavailable("down".into()));
            }
            self.stored.lock().push(message);
            Ok(())
        }
    }

    fn message(ttl: u32) -> StoredMessage {
        StoredMessage {
            tenant: 1,
            ssid: Ssid::new(1, "a/"),
            ttl,
            payload: Bytes::from_static(b"hi"),
        }
    }

    #[tokio::test]
    async fn test_worker_stores_queued_messages_on_shutdown() {
        let store = Arc::new(MemoryStore::default());
        let (worker, handle) = StoreWorker::new(store.clone(), 8);
        handle.submit(message(10)).unwrap();
        handle.submit(message(20)).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = worker.spawn(stop_rx);
        stop_tx.send(true).unwrap();
        task.await.unwrap();
        let ttls: Vec<u32> = store.stored.lock().iter().map(|m| m.ttl).collect();
        assert_eq!(ttls, vec![10, 20]);
        assert_eq!(handle.submit(message(30)), Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn test_full_queue_is_reported_not_awaited() {
        let store = Arc::new(MemoryStore::default());
        let (_worker, handle) = StoreWorker::new(store, 1);
        handle.submit(message(1)).unwrap();
        assert_eq!(handle.submit(message(2)), Err(StoreError::QueueFull));
    }

    #[tokio::test]
    async fn test_store_failures_do_not_stop_the_worker() {
        let store = Arc::new(MemoryStore {
            fail: true,
            ..MemoryStore::default()
        });
        let (worker, handle) = StoreWorker::new(store, 4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = worker.spawn(stop_rx);
        handle.submit(message(1)).unwrap();
        handle.submit(message(2)).unwrap();
        drop(handle);
        task.await.unwrap();
    }
}
