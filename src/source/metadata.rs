//! Metadata messages: a JSON body plus string message attributes.

use super::{digest_id, DecodeError, DecodedBatch};
use crate::types::{Event, EventId, EventKind, KIND_ATTRIBUTE};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Build a `MetadataSet` event from a message body and its attributes.
///
/// Body fields become the payload; string values are kept verbatim and other
/// scalars use their JSON text. The subject key is the body's `id`, empty when
/// absent. Required fields are not checked here.
pub fn decode_metadata(
    body: &str,
    attributes: &BTreeMap<String, String>,
) -> Result<Event, DecodeError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let fields = value.as_object().ok_or(DecodeError::NotAnObject)?;
    Ok(build(body, fields, attributes, None))
}

/// Decode an SNS notification carrying a metadata message.
///
/// Accepts both attribute encodings: `{"Type","Value"}` as delivered to
/// subscribers and `{"DataType","StringValue"}` as published. The envelope's
/// `MessageId` becomes the event id when present.
pub fn decode_metadata_envelope(raw: &str) -> Result<Event, DecodeError> {
    let envelope: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    envelope_event(&envelope)
}

/// Decode a batch of metadata notifications.
///
/// Takes a Lambda SNS batch (`Records[].Sns`), an SQS batch whose bodies are
/// SNS envelopes (`Records[].body`), or a single bare envelope. Each element
/// becomes one `MetadataSet` event; malformed elements are counted in
/// `dropped` and the rest of the batch still decodes.
pub fn decode_metadata_batch(raw: &str) -> Result<DecodedBatch, DecodeError> {
    let root: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let root = root.as_object().ok_or(DecodeError::UnrecognizedEnvelope)?;

    let mut batch = DecodedBatch::default();
    if let Some(records) = root.get("Records").and_then(Value::as_array) {
        for (index, record) in records.iter().enumerate() {
            match record_event(record) {
                Ok(event) => batch.events.push(event),
                Err(e) => {
                    warn!(index, error = %e, "dropping malformed metadata record");
                    batch.dropped += 1;
                }
            }
        }
    } else if root.contains_key("Message") {
        match envelope_event(&Value::Object(root.clone())) {
            Ok(event) => batch.events.push(event),
            Err(e) => {
                warn!(error = %e, "dropping malformed metadata notification");
                batch.dropped += 1;
            }
        }
    } else {
        return Err(DecodeError::UnrecognizedEnvelope);
    }
    Ok(batch)
}

/// One batch element: `{"Sns": envelope}`, `{"body": "<envelope json>"}` or a
/// bare envelope.
fn record_event(record: &Value) -> Result<Event, DecodeError> {
    if let Some(envelope) = record.get("Sns") {
        return envelope_event(envelope);
    }
    if let Some(body) = record.get("body").and_then(Value::as_str) {
        let envelope: Value =
            serde_json::from_str(body).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        return envelope_event(&envelope);
    }
    envelope_event(record)
}

fn envelope_event(envelope: &Value) -> Result<Event, DecodeError> {
    let body = envelope
        .get("Message")
        .and_then(Value::as_str)
        .ok_or(DecodeError::UnrecognizedEnvelope)?;

    let mut attributes = BTreeMap::new();
    if let Some(declared) = envelope.get("MessageAttributes").and_then(Value::as_object) {
        for (name, attr) in declared {
            let value = attr
                .get("Value")
                .or_else(|| attr.get("StringValue"))
                .and_then(Value::as_str);
            if let Some(value) = value {
                attributes.insert(name.clone(), value.to_string());
            }
        }
    }

    let value: Value =
        serde_json::from_str(body).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let fields = value.as_object().ok_or(DecodeError::NotAnObject)?;
    let message_id = envelope.get("MessageId").and_then(Value::as_str);
    Ok(build(body, fields, &attributes, message_id))
}

fn build(
    body: &str,
    fields: &Map<String, Value>,
    attributes: &BTreeMap<String, String>,
    message_id: Option<&str>,
) -> Event {
    let subject_key = fields.get("id").and_then(Value::as_str).unwrap_or_default();

    let id = match message_id {
        Some(id) if !id.is_empty() => EventId::new(id),
        _ => {
            let mut parts = vec![body];
            for (name, value) in attributes {
                parts.push(name);
                parts.push(value);
            }
            digest_id(&parts)
        }
    };

    let mut event = Event::new(id, EventKind::MetadataSet, subject_key);
    for (name, value) in attributes {
        if name != KIND_ATTRIBUTE {
            event = event.with_attribute(name.as_str(), value.as_str());
        }
    }
    for (name, value) in fields {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        event = event.with_payload(name.as_str(), text);
    }
    event
}
