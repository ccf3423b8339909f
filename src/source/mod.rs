//! Event source adapter.
//!
//! Turns upstream storage-change notifications into canonical [`Event`]s.
//! The notification may arrive bare, inside an SNS envelope, inside an SQS
//! batch, or any nesting of those:
//!
//! ```text
//! {"Records":[{"body":"{\"Message\":\"{\\\"Records\\\":[{\\\"s3\\\":...}]}\"}"}]}
//!   SQS batch ──► SNS envelope ──► S3 notification ──► Event per record
//! ```
//!
//! Each storage record becomes one event. A malformed record is dropped with
//! a diagnostic without failing the rest of the batch.

mod metadata;

pub use metadata::{decode_metadata, decode_metadata_batch, decode_metadata_envelope};

use crate::types::{Event, EventId, EventKind};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Attribute carrying the source bucket.
pub const BUCKET_ATTRIBUTE: &str = "bucket";

/// Envelopes nested deeper than this are dropped.
const MAX_NESTING: usize = 4;

/// Hex characters kept from digest-derived ids.
const DIGEST_ID_LEN: usize = 32;

/// Errors rejecting a whole input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("unrecognized envelope")]
    UnrecognizedEnvelope,

    #[error("metadata message body must be a JSON object")]
    NotAnObject,
}

/// Result of decoding one upstream payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedBatch {
    pub events: Vec<Event>,
    /// Malformed elements that were discarded.
    pub dropped: usize,
    /// Well-formed elements of a kind this pipeline does not handle.
    pub skipped: usize,
}

/// Decode a storage notification, unwrapping any SNS/SQS envelopes.
///
/// Only a payload that is not JSON at all, or whose outermost shape is not
/// recognized, is an error.
pub fn decode_batch(raw: &str) -> Result<DecodedBatch, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let mut batch = DecodedBatch::default();
    if !visit(&value, 0, &mut batch) {
        return Err(DecodeError::UnrecognizedEnvelope);
    }
    Ok(batch)
}

/// Walk one envelope level. Returns false if the shape was not recognized.
fn visit(value: &Value, depth: usize, batch: &mut DecodedBatch) -> bool {
    if depth > MAX_NESTING {
        warn!(depth, "envelope nested too deeply, dropping");
        batch.dropped += 1;
        return true;
    }

    if let Some(records) = value.get("Records").and_then(Value::as_array) {
        for record in records {
            visit_record(record, depth, batch);
        }
        return true;
    }

    if let Some(message) = value.get("Message").and_then(Value::as_str) {
        visit_embedded(message, depth, batch);
        return true;
    }

    if value.get("Event").and_then(Value::as_str) == Some("s3:TestEvent") {
        debug!("skipping storage test event");
        batch.skipped += 1;
        return true;
    }

    false
}

fn visit_record(record: &Value, depth: usize, batch: &mut DecodedBatch) {
    if record.get("s3").is_some() {
        match storage_event(record) {
            Ok(Some(event)) => batch.events.push(event),
            Ok(None) => batch.skipped += 1,
            Err(reason) => {
                warn!(reason, "dropping malformed storage record");
                batch.dropped += 1;
            }
        }
    } else if let Some(body) = record.get("body").and_then(Value::as_str) {
        visit_embedded(body, depth, batch);
    } else if let Some(message) = record.pointer("/Sns/Message").and_then(Value::as_str) {
        visit_embedded(message, depth, batch);
    } else {
        warn!("dropping record of unknown shape");
        batch.dropped += 1;
    }
}

/// Envelopes carry their inner document as a JSON string.
fn visit_embedded(text: &str, depth: usize, batch: &mut DecodedBatch) {
    match serde_json::from_str::<Value>(text) {
        Ok(inner) => {
            if !visit(&inner, depth + 1, batch) {
                warn!("dropping embedded message of unknown shape");
                batch.dropped += 1;
            }
        }
        Err(e) => {
            warn!(error = %e, "dropping embedded message that is not JSON");
            batch.dropped += 1;
        }
    }
}

/// Map one S3 record. `Ok(None)` means a recognized but unhandled event name.
fn storage_event(record: &Value) -> Result<Option<Event>, &'static str> {
    let event_name = record
        .get("eventName")
        .and_then(Value::as_str)
        .ok_or("missing eventName")?;

    let kind = if event_name.starts_with("ObjectCreated:") {
        EventKind::UploadCreated
    } else if event_name.starts_with("ObjectRemoved:") {
        EventKind::UploadRemoved
    } else {
        debug!(event_name, "skipping unhandled storage event");
        return Ok(None);
    };

    let raw_key = record
        .pointer("/s3/object/key")
        .and_then(Value::as_str)
        .ok_or("missing object key")?;
    let key = decode_key(raw_key).ok_or("object key does not decode to UTF-8")?;
    if key.is_empty() {
        return Err("empty object key");
    }

    let bucket = record
        .pointer("/s3/bucket/name")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let etag = record.pointer("/s3/object/eTag").and_then(Value::as_str);
    let event_time = record.get("eventTime").and_then(Value::as_str);

    // Without a sequencer, etag and event time tell re-uploads of a key apart
    let id = match record.pointer("/s3/object/sequencer").and_then(Value::as_str) {
        Some(sequencer) if !sequencer.is_empty() => EventId::new(sequencer),
        _ => digest_id(&[
            event_name,
            bucket,
            &key,
            etag.unwrap_or_default(),
            event_time.unwrap_or_default(),
        ]),
    };

    let mut event = Event::new(id, kind, key).with_attribute(BUCKET_ATTRIBUTE, bucket);
    if let Some(size) = record.pointer("/s3/object/size").and_then(Value::as_u64) {
        event = event.with_payload("size", size.to_string());
    }
    if let Some(etag) = etag {
        event = event.with_payload("etag", etag);
    }
    if let Some(time) = event_time {
        event = event.with_payload("event_time", time);
    }
    Ok(Some(event))
}

/// Storage keys arrive form-encoded: `+` is a space, then `%XX` escapes.
pub fn decode_key(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(|key| key.into_owned())
}

/// Deterministic id from the identifying parts of a message.
pub(crate) fn digest_id(parts: &[&str]) -> EventId {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(DIGEST_ID_LEN);
    EventId(id)
}
