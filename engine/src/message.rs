//! Change messages exchanged with upstream.
//!
//! Outbound changes are emitted under the event name of their type
//! (`insert`, `update`, `delete`). Upstream answers with an acknowledgment
//! and broadcasts the canonical change to other replicas as
//! `changes.<type>`.

use crate::{error::Result, CollectionName, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of inbound change events.
pub const CHANGES_EVENT_PREFIX: &str = "changes.";

/// Error names upstream uses for unique-constraint violations.
const UNIQUE_VIOLATION_NAMES: [&str; 2] = [
    "UniqueConstraintError",
    "SequelizeUniqueConstraintError",
];

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }

    /// Name of the event upstream broadcasts for this kind.
    pub fn changes_event(&self) -> String {
        format!("{}{}", CHANGES_EVENT_PREFIX, self.as_str())
    }

    /// Parse either a bare type (`insert`) or a broadcast event name
    /// (`changes.insert`).
    pub fn from_event(event: &str) -> Option<Self> {
        match event.strip_prefix(CHANGES_EVENT_PREFIX).unwrap_or(event) {
            "insert" => Some(ChangeType::Insert),
            "update" => Some(ChangeType::Update),
            "delete" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by upstream for a change it could not persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Error class name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            message,
        }
    }

    pub fn unique_violation(message: impl Into<String>) -> Self {
        Self::new(UNIQUE_VIOLATION_NAMES[0], Some(message.into()))
    }

    /// Whether two writers created logically-equivalent records.
    pub fn is_unique_violation(&self) -> bool {
        UNIQUE_VIOLATION_NAMES.contains(&self.name.as_str())
    }
}

/// An inbound change: a broadcast from upstream or the acknowledgment of one
/// of our own outbound changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub kind: ChangeType,
    pub collection: CollectionName,
    pub record: Record,
    /// Record whose id collided, or the optimistic record an acknowledgment
    /// answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ChangeMessage {
    pub fn new(kind: ChangeType, collection: impl Into<CollectionName>, record: Record) -> Self {
        Self {
            kind,
            collection: collection.into(),
            record,
            prior: None,
            error: None,
        }
    }

    pub fn with_prior(mut self, prior: Record) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Decode a raw inbound payload, rejecting anything the reconciler could
    /// not key.
    ///
    /// Accepts the message itself, a `changes` frame (`{ "type": "changes",
    /// "event": ..., "data": ... }`), an `ack` frame carrying it as `payload`,
    /// or the `{ "payload": { "data": ... } }` envelope.
    pub fn from_value(value: Value) -> Result<Self> {
        let value = unwrap_envelope(value);
        let message: ChangeMessage = serde_json::from_value(value)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    /// Check the fields the reconciler keys on.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(Error::MalformedMessage("missing collection".into()));
        }
        if !self.record.has_id() {
            return Err(Error::MalformedMessage(format!(
                "{} message for {} has no record id",
                self.kind, self.collection
            )));
        }
        Ok(())
    }

    pub fn is_unique_violation(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(ErrorInfo::is_unique_violation)
    }
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("record") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        Value::Object(mut map) if map.contains_key("payload") => match map.remove("payload") {
            Some(Value::Object(mut payload)) if payload.contains_key("data") => {
                payload.remove("data").unwrap_or(Value::Null)
            }
            Some(other) => other,
            None => Value::Null,
        },
        other => other,
    }
}

/// A local change sent upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChange {
    #[serde(rename = "type")]
    pub kind: ChangeType,
    pub collection: CollectionName,
    pub target: Record,
}

impl OutboundChange {
    pub fn new(kind: ChangeType, collection: impl Into<CollectionName>, target: Record) -> Self {
        Self {
            kind,
            collection: collection.into(),
            target,
        }
    }

    /// Event name this change is emitted under.
    pub fn event(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Turn an acknowledgment payload into the inbound message to reconcile.
    ///
    /// `true`, `null` and other non-object acknowledgments carry nothing to
    /// merge. An object is either a full change message or a bare canonical
    /// record. When upstream does not name the prior record, the target we
    /// sent is used so a re-keyed create can be matched to its optimistic
    /// copy.
    pub fn acknowledgment(&self, ack: Value) -> Result<Option<ChangeMessage>> {
        let Value::Object(mut map) = ack else {
            return Ok(None);
        };
        let mut message = if map.contains_key("record") {
            map.entry("type")
                .or_insert_with(|| Value::String(self.kind.as_str().into()));
            map.entry("collection")
                .or_insert_with(|| Value::String(self.collection.clone()));
            serde_json::from_value::<ChangeMessage>(Value::Object(map))
                .map_err(|e| Error::MalformedMessage(e.to_string()))?
        } else {
            ChangeMessage::new(self.kind, self.collection.clone(), Record::from(map))
        };
        if message.prior.is_none() {
            message.prior = Some(self.target.clone());
        }
        message.validate()?;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_type_event_names() {
        assert_eq!(ChangeType::Insert.changes_event(), "changes.insert");
        assert_eq!(ChangeType::from_event("changes.delete"), Some(ChangeType::Delete));
        assert_eq!(ChangeType::from_event("update"), Some(ChangeType::Update));
        assert_eq!(ChangeType::from_event("changes.upsert"), None);
    }

    #[test]
    fn decode_message_with_type_tag() {
        let raw = json!({
            "type": "update",
            "collection": "students",
            "record": {"id": "S1", "active": false}
        });
        let msg = ChangeMessage::from_value(raw).unwrap();
        assert_eq!(msg.kind, ChangeType::Update);
        assert_eq!(msg.collection, "students");
        assert_eq!(msg.record.id().as_deref(), Some("S1"));
        assert!(msg.error.is_none());
    }

    #[test]
    fn decode_channel_envelope() {
        let raw = json!({
            "payload": {"data": {
                "type": "insert",
                "collection": "divisionClasses",
                "record": {"id": "dc-1"}
            }}
        });
        let msg = ChangeMessage::from_value(raw).unwrap();
        assert_eq!(msg.collection, "divisionClasses");
    }

    #[test]
    fn decode_changes_frame() {
        let raw = json!({
            "type": "changes",
            "event": "changes.insert",
            "data": {
                "type": "insert",
                "collection": "classes",
                "record": {"id": "C9", "title": "Choir"}
            }
        });
        let msg = ChangeMessage::from_value(raw).unwrap();
        assert_eq!(msg.kind, ChangeType::Insert);
        assert_eq!(msg.record.id().as_deref(), Some("C9"));
    }

    #[test]
    fn malformed_messages_are_rejected() {
        let missing_collection = json!({"type": "insert", "collection": "", "record": {"id": "x"}});
        assert!(matches!(
            ChangeMessage::from_value(missing_collection),
            Err(Error::MalformedMessage(_))
        ));

        let missing_id = json!({"type": "update", "collection": "people", "record": {"name": "x"}});
        assert!(matches!(
            ChangeMessage::from_value(missing_id),
            Err(Error::MalformedMessage(_))
        ));

        let bad_type = json!({"type": "upsert", "collection": "people", "record": {"id": "x"}});
        assert!(ChangeMessage::from_value(bad_type).is_err());
    }

    #[test]
    fn unique_violation_names() {
        assert!(ErrorInfo::new("SequelizeUniqueConstraintError", None).is_unique_violation());
        assert!(ErrorInfo::unique_violation("dup").is_unique_violation());
        assert!(!ErrorInfo::new("RevisionMismatchError", None).is_unique_violation());
    }

    #[test]
    fn outbound_serializes_target() {
        let change = OutboundChange::new(
            ChangeType::Insert,
            "classes",
            Record::new().with("id", "L1").with("title", "Math"),
        );
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(
            json,
            json!({"type": "insert", "collection": "classes", "target": {"id": "L1", "title": "Math"}})
        );
        assert_eq!(change.event(), "insert");
    }

    #[test]
    fn acknowledgment_with_bare_record_keeps_target_as_prior() {
        let change = OutboundChange::new(
            ChangeType::Insert,
            "classes",
            Record::new().with("id", "L1").with("title", "Math"),
        );
        let msg = change
            .acknowledgment(json!({"id": "C1", "title": "Math"}))
            .unwrap()
            .unwrap();

        assert_eq!(msg.kind, ChangeType::Insert);
        assert_eq!(msg.record.id().as_deref(), Some("C1"));
        assert_eq!(msg.prior.unwrap().id().as_deref(), Some("L1"));
    }

    #[test]
    fn acknowledgment_without_payload() {
        let change = OutboundChange::new(ChangeType::Update, "classes", Record::new().with("id", "C1"));
        assert_eq!(change.acknowledgment(json!(true)).unwrap(), None);
        assert_eq!(change.acknowledgment(Value::Null).unwrap(), None);
    }

    #[test]
    fn acknowledgment_with_error() {
        let change = OutboundChange::new(
            ChangeType::Insert,
            "students",
            Record::new().with("id", "L1").with("peopleId", "P1"),
        );
        let ack = json!({
            "record": {"id": "C7", "peopleId": "P1"},
            "prior": {"id": "L1", "peopleId": "P1"},
            "error": {"name": "UniqueConstraintError"}
        });
        let msg = change.acknowledgment(ack).unwrap().unwrap();
        assert!(msg.is_unique_violation());
        assert_eq!(msg.collection, "students");
    }
}
