//! In-memory catalog store.

use crate::types::CatalogRecord;
use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

use super::feed::{CatalogChange, ChangeFeed};
use super::{CatalogError, CatalogStore, PutOutcome};

/// Catalog held in a map, with a change feed and failure injection.
///
/// All writes take the same write lock, so writes to one key never
/// interleave. Changes are published while the lock is held, which keeps the
/// feed in commit order.
pub struct MemoryCatalog {
    records: RwLock<HashMap<String, CatalogRecord>>,
    feed: ChangeFeed,
    failing_puts: AtomicU32,
    failing_updates: AtomicU32,
    failing_deletes: AtomicU32,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            feed: ChangeFeed::new(),
            failing_puts: AtomicU32::new(0),
            failing_updates: AtomicU32::new(0),
            failing_deletes: AtomicU32::new(0),
        }
    }

    /// Make the next `n` puts fail with `Unavailable`.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` updates fail with `Unavailable`.
    pub fn fail_next_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` deletes fail with `Unavailable`.
    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, sorted by key.
    pub fn records(&self) -> Vec<CatalogRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    fn injected_failure(counter: &AtomicU32, op: &str) -> Result<(), CatalogError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(CatalogError::Unavailable(format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogStore for MemoryCatalog {
    fn put(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<PutOutcome, CatalogError> {
        Self::injected_failure(&self.failing_puts, "put")?;

        let mut records = self.records.write();
        match records.get_mut(key) {
            None => {
                let record = CatalogRecord {
                    key: key.to_string(),
                    fields: fields.clone(),
                };
                records.insert(key.to_string(), record.clone());
                self.feed.publish(CatalogChange::Inserted(record));
                debug!(key, "catalog record created");
                Ok(PutOutcome::Created)
            }
            Some(existing) => {
                let mut changed = false;
                for (field, value) in fields {
                    if existing.fields.get(field) != Some(value) {
                        existing.fields.insert(field.clone(), value.clone());
                        changed = true;
                    }
                }
                if changed {
                    self.feed.publish(CatalogChange::Modified(existing.clone()));
                    Ok(PutOutcome::Updated)
                } else {
                    Ok(PutOutcome::Unchanged)
                }
            }
        }
    }

    fn update(&self, key: &str, field: &str, value: &str) -> Result<(), CatalogError> {
        Self::injected_failure(&self.failing_updates, "update")?;

        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))?;

        if record.fields.get(field).map(String::as_str) != Some(value) {
            record.fields.insert(field.to_string(), value.to_string());
            self.feed.publish(CatalogChange::Modified(record.clone()));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, CatalogError> {
        Self::injected_failure(&self.failing_deletes, "delete")?;

        let mut records = self.records.write();
        let existed = records.remove(key).is_some();
        if existed {
            self.feed.publish(CatalogChange::Removed {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    fn get(&self, key: &str) -> Result<Option<CatalogRecord>, CatalogError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn subscribe_changes(&self) -> Option<Receiver<CatalogChange>> {
        Some(self.feed.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_put_is_idempotent() {
        let catalog = MemoryCatalog::new();
        let changes = catalog.subscribe_changes().unwrap();

        assert_eq!(catalog.put("a.png", &fields(&[])).unwrap(), PutOutcome::Created);
        assert_eq!(catalog.put("a.png", &fields(&[])).unwrap(), PutOutcome::Unchanged);
        assert_eq!(catalog.len(), 1);

        assert!(matches!(changes.try_recv(), Ok(CatalogChange::Inserted(_))));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_put_merges_fields() {
        let catalog = MemoryCatalog::new();
        catalog.put("a.png", &fields(&[("Caption", "Sunset")])).unwrap();

        // A bare re-put keeps existing metadata
        assert_eq!(catalog.put("a.png", &fields(&[])).unwrap(), PutOutcome::Unchanged);
        assert_eq!(
            catalog.put("a.png", &fields(&[("Date", "2024")])).unwrap(),
            PutOutcome::Updated
        );

        let record = catalog.get("a.png").unwrap().unwrap();
        assert_eq!(record.fields, fields(&[("Caption", "Sunset"), ("Date", "2024")]));
    }

    #[test]
    fn test_update_requires_record() {
        let catalog = MemoryCatalog::new();
        assert_eq!(
            catalog.update("missing.png", "Caption", "x"),
            Err(CatalogError::NotFound("missing.png".into()))
        );

        catalog.put("a.png", &fields(&[])).unwrap();
        catalog.update("a.png", "Caption", "Sunset").unwrap();
        assert_eq!(
            catalog.get("a.png").unwrap().unwrap().fields.get("Caption"),
            Some(&"Sunset".to_string())
        );
    }

    #[test]
    fn test_delete() {
        let catalog = MemoryCatalog::new();
        catalog.put("a.png", &fields(&[])).unwrap();

        assert!(catalog.delete("a.png").unwrap());
        assert!(!catalog.delete("a.png").unwrap());
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_failure_injection_counts_down() {
        let catalog = MemoryCatalog::new();
        catalog.fail_next_puts(2);

        assert!(matches!(
            catalog.put("a.png", &fields(&[])),
            Err(CatalogError::Unavailable(_))
        ));
        assert!(catalog.put("a.png", &fields(&[])).is_err());
        assert_eq!(catalog.put("a.png", &fields(&[])).unwrap(), PutOutcome::Created);
    }

    #[test]
    fn test_concurrent_puts_create_one_record() {
        let catalog = std::sync::Arc::new(MemoryCatalog::new());
        let changes = catalog.subscribe_changes().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = std::sync::Arc::clone(&catalog);
                std::thread::spawn(move || catalog.put("same.png", &BTreeMap::new()).unwrap())
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == PutOutcome::Created)
            .count();

        assert_eq!(created, 1);
        assert_eq!(changes.try_iter().count(), 1);
    }
}
