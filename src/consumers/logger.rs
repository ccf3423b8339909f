//! Validates uploads and writes their catalog records.

use crate::catalog::CatalogStore;
use crate::types::{Event, EventKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{EventHandler, HandleError, HandleResult, PermanentPolicy};

/// Upload extensions the catalog accepts.
pub const ACCEPTED_EXTENSIONS: [&str; 2] = ["jpeg", "png"];

/// Lowercased text after the last `.` of the key's final path segment.
pub fn file_extension(key: &str) -> Option<String> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Catalogs valid uploads.
///
/// An unsupported file type is a permanent failure that still goes through
/// the retry budget, so it ends up in the dead-letter queue.
pub struct UploadLogger {
    catalog: Arc<dyn CatalogStore>,
}

impl UploadLogger {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }
}

impl EventHandler for UploadLogger {
    fn name(&self) -> &str {
        "upload-logger"
    }

    fn handle(&self, event: &Event) -> HandleResult {
        if event.kind != EventKind::UploadCreated {
            debug!(event_id = %event.id, kind = %event.kind, "logger ignoring event");
            return Ok(());
        }

        let key = event.subject_key.as_str();
        let extension = file_extension(key);
        let accepted = extension
            .as_deref()
            .map_or(false, |ext| ACCEPTED_EXTENSIONS.contains(&ext));
        if !accepted {
            warn!(key, extension = ?extension, "unsupported file type");
            return Err(HandleError::Permanent(format!(
                "unsupported file type: {}",
                extension.as_deref().unwrap_or("<none>")
            )));
        }

        let outcome = self
            .catalog
            .put(key, &BTreeMap::new())
            .map_err(|e| HandleError::Transient(e.to_string()))?;

        info!(key, ?outcome, "upload logged");
        Ok(())
    }

    fn permanent_policy(&self) -> PermanentPolicy {
        PermanentPolicy::Retry
    }
}
