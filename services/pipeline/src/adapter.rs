//! Source adapter for raw provider notifications.
//!
//! Upload stores and editor tools deliver notifications in their own wire
//! formats. This module turns any supported format into a [`TopicMessage`]
//! carrying the canonical body, so the rest of the pipeline never sees
//! provider-specific JSON.

use crate::event::{TopicMessage, UploadEvent, UploadEventKind, UploadNotice};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while normalizing a provider notification
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Malformed notification payload: {0}")]
    MalformedPayload(String),

    #[error("Notification shape not recognized")]
    UnrecognizedShape,
}

/// Normalize a raw provider notification into a routable message.
///
/// Returns `Ok(None)` when the notification is well-formed but carries
/// nothing routable, for example when every record in it has an event name
/// the catalog does not track.
pub fn normalize_notification(raw: &str) -> Result<Option<TopicMessage>, AdapterError> {
    let document: Value =
        serde_json::from_str(raw).map_err(|e| AdapterError::MalformedPayload(e.to_string()))?;

    let (inner, attributes) = unwrap_envelope(document)?;

    if let Some(records) = inner.get("Records").and_then(Value::as_array) {
        return normalize_storage_records(records, attributes);
    }

    // Metadata submissions arrive as a flat object keyed by the image id.
    if inner.get("id").map(Value::is_string).unwrap_or(false) {
        debug!("Normalized metadata submission");
        return Ok(Some(TopicMessage {
            attributes,
            body: inner,
        }));
    }

    metrics::counter!("pipeline.adapter.unrecognized").increment(1);
    Err(AdapterError::UnrecognizedShape)
}

/// Strip the delivery envelope some providers wrap around the payload.
///
/// The envelope carries the real payload as an embedded JSON string in
/// `Message` and routing attributes under `MessageAttributes`. Documents
/// without an envelope are passed through untouched.
fn unwrap_envelope(document: Value) -> Result<(Value, BTreeMap<String, String>), AdapterError> {
    let Some(message) = document.get("Message") else {
        return Ok((document, BTreeMap::new()));
    };

    let inner = match message {
        Value::String(embedded) => serde_json::from_str(embedded)
            .map_err(|e| AdapterError::MalformedPayload(format!("embedded message: {e}")))?,
        other => other.clone(),
    };

    let mut attributes = BTreeMap::new();
    if let Some(raw_attributes) = document.get("MessageAttributes").and_then(Value::as_object) {
        for (name, entry) in raw_attributes {
            let value = match entry {
                Value::String(s) => Some(s.clone()),
                Value::Object(fields) => fields
                    .get("Value")
                    .or_else(|| fields.get("StringValue"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            };
            if let Some(value) = value {
                attributes.insert(name.clone(), value);
            }
        }
    }

    Ok((inner, attributes))
}

fn normalize_storage_records(
    records: &[Value],
    attributes: BTreeMap<String, String>,
) -> Result<Option<TopicMessage>, AdapterError> {
    let mut normalized = Vec::with_capacity(records.len());

    for record in records {
        let Some(event_name) = record.get("eventName").and_then(Value::as_str) else {
            warn!("Skipping storage record without an event name");
            metrics::counter!("pipeline.adapter.records_skipped").increment(1);
            continue;
        };

        let Some(kind) = map_event_name(event_name) else {
            warn!(event_name, "Skipping storage record with untracked event name");
            metrics::counter!("pipeline.adapter.records_skipped").increment(1);
            continue;
        };

        let bucket = record
            .pointer("/s3/bucket/name")
            .and_then(Value::as_str);
        let key = record.pointer("/s3/object/key").and_then(Value::as_str);

        let (Some(bucket), Some(key)) = (bucket, key) else {
            warn!(event_name, "Skipping storage record without bucket or key");
            metrics::counter!("pipeline.adapter.records_skipped").increment(1);
            continue;
        };

        normalized.push(UploadEvent {
            kind,
            object_key: normalize_object_key(key),
            source_location: bucket.to_string(),
        });
    }

    if normalized.is_empty() {
        debug!("Storage notification carried no routable records");
        return Ok(None);
    }

    let message = UploadNotice::new(normalized)
        .into_message()
        .map_err(|e| AdapterError::MalformedPayload(e.to_string()))?;

    Ok(Some(TopicMessage {
        attributes,
        body: message.body,
    }))
}

fn map_event_name(event_name: &str) -> Option<UploadEventKind> {
    if event_name.starts_with("ObjectCreated") {
        Some(UploadEventKind::Created)
    } else if event_name.starts_with("ObjectRemoved") {
        Some(UploadEventKind::Removed)
    } else {
        None
    }
}

/// Decode an object key the way upload stores encode it.
///
/// Keys arrive URL-encoded with spaces folded to `+`. The `+` fold is undone
/// first, then percent sequences are decoded. A malformed percent sequence is
/// kept verbatim rather than rejected, since the store accepted the key.
pub fn normalize_object_key(raw: &str) -> String {
    let unplussed = raw.replace('+', " ");
    let bytes = unplussed.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                decoded.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    match String::from_utf8(decoded) {
        Ok(key) => key,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_envelope(event_name: &str, key: &str) -> String {
        let embedded = serde_json::json!({
            "Records": [{
                "eventName": event_name,
                "s3": {
                    "bucket": { "name": "photos" },
                    "object": { "key": key }
                }
            }]
        });
        serde_json::json!({
            "Type": "Notification",
            "Message": embedded.to_string()
        })
        .to_string()
    }

    #[test]
    fn test_normalize_object_key_decodes_plus_and_percent() {
        assert_eq!(normalize_object_key("my+photo.jpeg"), "my photo.jpeg");
        assert_eq!(normalize_object_key("nested%2Fdir%2Fcat.png"), "nested/dir/cat.png");
        assert_eq!(normalize_object_key("caf%C3%A9.png"), "café.png");
    }

    #[test]
    fn test_normalize_object_key_keeps_malformed_sequences() {
        assert_eq!(normalize_object_key("bad%2.png"), "bad%2.png");
        assert_eq!(normalize_object_key("trailing%"), "trailing%");
        assert_eq!(normalize_object_key("not%GGhex"), "not%GGhex");
    }

    #[test]
    fn test_creation_notification_is_normalized() {
        let raw = storage_envelope("ObjectCreated:Put", "sunny+day.jpeg");
        let message = normalize_notification(&raw).unwrap().unwrap();

        let notice = UploadNotice::from_message(&message).unwrap();
        assert_eq!(notice.records.len(), 1);
        assert_eq!(notice.records[0].kind, UploadEventKind::Created);
        assert_eq!(notice.records[0].object_key, "sunny day.jpeg");
        assert_eq!(notice.records[0].source_location, "photos");
    }

    #[test]
    fn test_removal_notification_is_normalized() {
        let raw = storage_envelope("ObjectRemoved:Delete", "old.png");
        let message = normalize_notification(&raw).unwrap().unwrap();

        let notice = UploadNotice::from_message(&message).unwrap();
        assert_eq!(notice.records[0].kind, UploadEventKind::Removed);
    }

    #[test]
    fn test_untracked_event_names_are_dropped() {
        let raw = storage_envelope("ObjectRestore:Post", "archive.png");
        assert!(normalize_notification(&raw).unwrap().is_none());
    }

    #[test]
    fn test_bare_records_document_is_accepted() {
        let raw = serde_json::json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "photos" },
                    "object": { "key": "direct.jpeg" }
                }
            }]
        })
        .to_string();

        let message = normalize_notification(&raw).unwrap().unwrap();
        let notice = UploadNotice::from_message(&message).unwrap();
        assert_eq!(notice.records[0].object_key, "direct.jpeg");
    }

    #[test]
    fn test_metadata_submission_keeps_attributes() {
        let raw = serde_json::json!({
            "Type": "Notification",
            "Message": "{\"id\":\"cat.png\",\"caption\":\"A cat\",\"photographer\":\"Ana\"}",
            "MessageAttributes": {
                "metadata_type": { "Type": "String", "Value": "Caption" }
            }
        })
        .to_string();

        let message = normalize_notification(&raw).unwrap().unwrap();
        assert_eq!(message.metadata_type(), Some("Caption"));
        assert_eq!(message.body.get("id").unwrap(), "cat.png");
    }

    #[test]
    fn test_unrecognized_document_is_rejected() {
        let raw = serde_json::json!({ "ping": true }).to_string();
        assert!(matches!(
            normalize_notification(&raw),
            Err(AdapterError::UnrecognizedShape)
        ));
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(matches!(
            normalize_notification("not json"),
            Err(AdapterError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_record_missing_key_is_skipped() {
        let embedded = serde_json::json!({
            "Records": [
                { "eventName": "ObjectCreated:Put", "s3": { "bucket": { "name": "photos" } } },
                {
                    "eventName": "ObjectCreated:Put",
                    "s3": { "bucket": { "name": "photos" }, "object": { "key": "kept.png" } }
                }
            ]
        });
        let raw = serde_json::json!({ "Message": embedded.to_string() }).to_string();

        let message = normalize_notification(&raw).unwrap().unwrap();
        let notice = UploadNotice::from_message(&message).unwrap();
        assert_eq!(notice.records.len(), 1);
        assert_eq!(notice.records[0].object_key, "kept.png");
    }
}
