//! Catalog store capability and its in-memory implementation.
//!
//! The catalog holds one [`CatalogRecord`] per upload. Writes are idempotent:
//! re-applying a `put` with the same fields leaves the record unchanged and
//! emits no change notification.

mod feed;
mod memory;

pub use feed::{CatalogChange, ChangeFeed};
pub use memory::MemoryCatalog;

use crate::types::CatalogRecord;
use crossbeam_channel::Receiver;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from a catalog store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// `update` on a key with no record.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The store could not be reached or timed out.
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// What a `put` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Durable key-value persistence for catalog records.
///
/// Writes to the same key must be serialized by the implementation.
pub trait CatalogStore: Send + Sync {
    /// Create the record, or merge `fields` into an existing one.
    fn put(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<PutOutcome, CatalogError>;

    /// Set one field. Fails with `NotFound` if the record does not exist.
    fn update(&self, key: &str, field: &str, value: &str) -> Result<(), CatalogError>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, CatalogError>;

    fn get(&self, key: &str) -> Result<Option<CatalogRecord>, CatalogError>;

    /// Committed changes, if this store publishes them.
    fn subscribe_changes(&self) -> Option<Receiver<CatalogChange>> {
        None
    }
}
