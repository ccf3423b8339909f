//! Core types shared by the topic, queues and consumers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Attribute every event carries so filters can select on kind.
pub const KIND_ATTRIBUTE: &str = "event_kind";

/// Opaque, source-assigned event identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        EventId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue-assigned message identifier (monotonic per queue).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(micros(duration))
    }

    /// This timestamp shifted forward by `duration`, saturating at the far future.
    pub fn after(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(micros(duration)))
    }
}

/// Whole microseconds in `duration`, clamped to `i64::MAX`.
pub(crate) fn micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// What happened upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UploadCreated,
    UploadRemoved,
    MetadataSet,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UploadCreated => "upload_created",
            EventKind::UploadRemoved => "upload_removed",
            EventKind::MetadataSet => "metadata_set",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical event envelope. Immutable once published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    /// Resource identifier, e.g. the uploaded object's key.
    pub subject_key: String,
    /// Used for filter matching.
    pub attributes: BTreeMap<String, String>,
    /// Free-form fields.
    pub payload: BTreeMap<String, String>,
}

impl Event {
    /// Create an event; the `event_kind` attribute is set from `kind`.
    pub fn new(id: EventId, kind: EventKind, subject_key: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(KIND_ATTRIBUTE.to_string(), kind.as_str().to_string());
        Self {
            id,
            kind,
            subject_key: subject_key.into(),
            attributes,
            payload: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add a payload field.
    pub fn with_payload(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn payload_field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).map(String::as_str)
    }
}

/// A catalog entry for one upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub key: String,
    pub fields: BTreeMap<String, String>,
}

impl CatalogRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }
}
