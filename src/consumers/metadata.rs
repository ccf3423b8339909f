//! Applies metadata updates to catalog records.

use crate::catalog::CatalogStore;
use crate::topic::Filter;
use crate::types::Event;
use std::sync::Arc;
use tracing::{info, warn};

use super::{EventHandler, HandleError, HandleResult, PermanentPolicy};

/// Attribute naming the catalog field to set.
pub const METADATA_TYPE_ATTRIBUTE: &str = "metadata_type";

/// Fields the updater may set.
pub const METADATA_TYPES: [&str; 3] = ["Caption", "Date", "Photographer"];

/// Sets one catalog field per event.
///
/// Malformed messages are acked and dropped: retrying cannot repair them.
pub struct MetadataUpdater {
    catalog: Arc<dyn CatalogStore>,
}

impl MetadataUpdater {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Subscription filter selecting supported metadata types.
    pub fn filter() -> Filter {
        Filter::attribute_in(METADATA_TYPE_ATTRIBUTE, METADATA_TYPES)
    }
}

fn required<'a>(event: &'a Event, field: &str) -> Result<&'a str, HandleError> {
    match event.payload_field(field) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(HandleError::Permanent(format!("missing payload field '{field}'"))),
    }
}

/// Extract `(field, id, value)` from a metadata event.
fn parse(event: &Event) -> Result<(&str, &str, &str), HandleError> {
    let field = event
        .attribute(METADATA_TYPE_ATTRIBUTE)
        .filter(|t| METADATA_TYPES.contains(t))
        .ok_or_else(|| {
            HandleError::Permanent(format!(
                "unsupported metadata_type: {:?}",
                event.attribute(METADATA_TYPE_ATTRIBUTE)
            ))
        })?;
    Ok((field, required(event, "id")?, required(event, "value")?))
}

impl EventHandler for MetadataUpdater {
    fn name(&self) -> &str {
        "metadata-updater"
    }

    fn handle(&self, event: &Event) -> HandleResult {
        let (field, id, value) = match parse(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "dropping malformed metadata message");
                return Err(e);
            }
        };

        self.catalog
            .update(id, field, value)
            .map_err(|e| HandleError::Transient(e.to_string()))?;

        info!(key = id, field, value, "metadata updated");
        Ok(())
    }

    fn permanent_policy(&self) -> PermanentPolicy {
        PermanentPolicy::Drop
    }
}
