//! Deletes catalog records for removed uploads.

use crate::catalog::CatalogStore;
use crate::topic::Filter;
use crate::types::{Event, EventKind};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{EventHandler, HandleError, HandleResult, PermanentPolicy};

pub struct UploadRemover {
    catalog: Arc<dyn CatalogStore>,
}

impl UploadRemover {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    pub fn filter() -> Filter {
        Filter::kinds([EventKind::UploadRemoved])
    }
}

impl EventHandler for UploadRemover {
    fn name(&self) -> &str {
        "upload-remover"
    }

    fn handle(&self, event: &Event) -> HandleResult {
        if event.kind != EventKind::UploadRemoved {
            return Ok(());
        }
        let key = event.subject_key.as_str();
        if key.is_empty() {
            return Err(HandleError::Permanent("removal without subject key".into()));
        }

        match self.catalog.delete(key) {
            Ok(true) => info!(key, "catalog record removed"),
            Ok(false) => debug!(key, "nothing to remove"),
            Err(e) => {
                error!(key, error = %e, "catalog delete failed");
                return Err(HandleError::Transient(e.to_string()));
            }
        }
        Ok(())
    }

    fn permanent_policy(&self) -> PermanentPolicy {
        PermanentPolicy::Drop
    }
}
