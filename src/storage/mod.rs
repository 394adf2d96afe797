//! Durable storage of subscribe requests.
//!
//! The registry only needs three things from persistence: append a request
//! under its id, forget an id, and list what is left. Two adapters ship
//! with the crate:
//! - [`MemoryStore`]: process-local, for tests and non-durable brokers
//! - [`SubscriptionLog`]: append-only file with checksummed frames

mod log;

pub use log::SubscriptionLog;

use crate::error::Result;
use crate::types::SubscriptionId;
use parking_lot::Mutex;

/// A persisted subscribe request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredSubscription {
    pub id: SubscriptionId,
    pub raw_request: Vec<u8>,
}

/// Durable log of subscribe requests.
pub trait SubscriptionStore: Send + Sync {
    /// Persist a request. Must be durable before returning `Ok`.
    fn insert(&self, id: &SubscriptionId, raw_request: &[u8]) -> Result<()>;

    /// Forget a request. Deleting an unknown id is not an error.
    fn delete(&self, id: &SubscriptionId) -> Result<()>;

    /// Every live request, oldest first.
    fn list_all(&self) -> Result<Vec<StoredSubscription>>;
}

/// In-memory store, insertion ordered.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<StoredSubscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.lock().iter().any(|e| &e.id == id)
    }
}

impl SubscriptionStore for MemoryStore {
    fn insert(&self, id: &SubscriptionId, raw_request: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| &e.id == id) {
            Some(existing) => existing.raw_request = raw_request.to_vec(),
            None => entries.push(StoredSubscription {
                id: id.clone(),
                raw_request: raw_request.to_vec(),
            }),
        }
        Ok(())
    }

    fn delete(&self, id: &SubscriptionId) -> Result<()> {
        self.entries.lock().retain(|e| &e.id != id);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<StoredSubscription>> {
        Ok(self.entries.lock().clone())
    }
}
