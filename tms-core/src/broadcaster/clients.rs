use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Chunks buffered per viewer before new ones are dropped for them.
pub const CLIENT_QUEUE_CHUNKS: usize = 50;

pub type ClientId = u64;

/// Viewers currently attached, each with its own bounded queue.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: Mutex<HashMap<ClientId, mpsc::Sender<Bytes>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (ClientId, mpsc::Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CHUNKS);
        self.lock().insert(id, tx);
        (id, rx)
    }

    pub fn deregister(&self, id: ClientId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drops every queue, which ends each viewer's response.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Offers `chunk` to every viewer without waiting. Returns how many
    /// queues accepted it.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        let clients = self.lock();
        let mut delivered = 0;
        for tx in clients.values() {
            match tx.try_send(chunk.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, mpsc::Sender<Bytes>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
