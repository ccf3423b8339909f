//! Change feed for committed catalog writes.

use crate::types::CatalogRecord;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A committed catalog write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogChange {
    /// A record was created.
    Inserted(CatalogRecord),
    /// An existing record's fields changed.
    Modified(CatalogRecord),
    /// A record was deleted.
    Removed { key: String },
}

/// Broadcasts catalog changes to subscribers.
pub struct ChangeFeed {
    /// Active subscribers by id.
    subscribers: RwLock<HashMap<u64, Sender<CatalogChange>>>,
    /// Counter for generating subscriber ids.
    next_id: AtomicU64,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive every change published from now on.
    pub fn subscribe(&self) -> Receiver<CatalogChange> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = unbounded();
        self.subscribers.write().insert(id, sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Send to all subscribers, forgetting those that hung up.
    pub fn publish(&self, change: CatalogChange) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscribers.read();
            for (id, sender) in subs.iter() {
                if sender.send(change.clone()).is_err() {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.write();
            for id in to_remove {
                subs.remove(&id);
            }
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
