//! Canonical event model for the Darkroom pipeline.
//!
//! Provider notifications arrive in several vendor formats; the source adapter
//! normalizes all of them into the types defined here before anything is routed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Message attribute carrying the metadata field kind ("Caption", "Date", ...)
pub const METADATA_TYPE_ATTRIBUTE: &str = "metadata_type";

/// Errors that can occur while encoding or decoding events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to decode event body: {0}")]
    DecodeError(String),

    #[error("Failed to encode event body: {0}")]
    EncodeError(String),
}

/// What happened to the object in the upload store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadEventKind {
    /// A new object was written
    Created,
    /// An existing object was deleted
    Removed,
}

impl UploadEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadEventKind::Created => "created",
            UploadEventKind::Removed => "removed",
        }
    }
}

/// A single normalized upload-store event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    /// Kind of change observed
    pub kind: UploadEventKind,
    /// Decoded object key within the store
    pub object_key: String,
    /// Bucket or container the object lives in
    pub source_location: String,
}

impl UploadEvent {
    pub fn created(object_key: impl Into<String>, source_location: impl Into<String>) -> Self {
        Self {
            kind: UploadEventKind::Created,
            object_key: object_key.into(),
            source_location: source_location.into(),
        }
    }

    pub fn removed(object_key: impl Into<String>, source_location: impl Into<String>) -> Self {
        Self {
            kind: UploadEventKind::Removed,
            object_key: object_key.into(),
            source_location: source_location.into(),
        }
    }
}

/// Canonical body published for upload notifications.
///
/// One provider notification can describe several object changes, so the
/// notice keeps them together and consumers iterate over `records`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadNotice {
    pub records: Vec<UploadEvent>,
}

impl UploadNotice {
    pub fn new(records: Vec<UploadEvent>) -> Self {
        Self { records }
    }

    /// Encode the notice into a routable message
    pub fn into_message(self) -> Result<TopicMessage, EventError> {
        let body = serde_json::to_value(&self).map_err(|e| EventError::EncodeError(e.to_string()))?;
        Ok(TopicMessage::new(body))
    }

    /// Decode a notice from a routed message body
    pub fn from_message(message: &TopicMessage) -> Result<Self, EventError> {
        message.decode_body()
    }
}

/// A metadata submission for an already cataloged image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEvent {
    /// Object key of the image the metadata belongs to
    pub id: String,
    /// Free-text caption supplied by the editor
    pub caption: String,
    /// Name of the photographer
    pub photographer: String,
}

impl MetadataEvent {
    /// Encode the event into a routable message tagged with its metadata kind
    pub fn into_message(self, metadata_type: &str) -> Result<TopicMessage, EventError> {
        let body = serde_json::to_value(&self).map_err(|e| EventError::EncodeError(e.to_string()))?;
        Ok(TopicMessage::new(body).with_attribute(METADATA_TYPE_ATTRIBUTE, metadata_type))
    }
}

/// A message as it travels through the topic and its queues.
///
/// Attributes are flat string pairs evaluated by subscription filters without
/// touching the body; the body is the structured payload consumers decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    /// Flat routing attributes attached outside the payload
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Structured payload
    pub body: serde_json::Value,
}

impl TopicMessage {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            attributes: BTreeMap::new(),
            body,
        }
    }

    /// Attach a routing attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get an attribute value
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    /// Get the metadata kind attribute
    pub fn metadata_type(&self) -> Option<&str> {
        self.attribute(METADATA_TYPE_ATTRIBUTE)
    }

    /// Deserialize the body into a typed event
    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.body.clone()).map_err(|e| EventError::DecodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_notice_body_shape() {
        let notice = UploadNotice::new(vec![UploadEvent::created("cat.png", "photos")]);
        let message = notice.into_message().unwrap();

        let records = message.body.get("records").unwrap().as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("kind").unwrap(), "created");
        assert_eq!(records[0].get("object_key").unwrap(), "cat.png");
        assert_eq!(records[0].get("source_location").unwrap(), "photos");
    }

    #[test]
    fn test_metadata_event_carries_attribute() {
        let event = MetadataEvent {
            id: "cat.png".to_string(),
            caption: "A cat".to_string(),
            photographer: "Ana".to_string(),
        };
        let message = event.into_message("Caption").unwrap();

        assert_eq!(message.metadata_type(), Some("Caption"));
        assert_eq!(message.body.get("id").unwrap(), "cat.png");
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let message = TopicMessage::new(serde_json::json!({"unexpected": true}));
        let result = UploadNotice::from_message(&message);
        assert!(matches!(result, Err(EventError::DecodeError(_))));
    }

    #[test]
    fn test_attribute_lookup() {
        let message = TopicMessage::new(serde_json::Value::Null)
            .with_attribute("metadata_type", "Date")
            .with_attribute("origin", "editor");

        assert_eq!(message.attribute("origin"), Some("editor"));
        assert_eq!(message.metadata_type(), Some("Date"));
        assert_eq!(message.attribute("missing"), None);
    }
}
