//! Record types for storing data.
//!
//! A record is a plain JSON object. A handful of fields carry meaning for the
//! replica (`id`, `createdAt`, `updatedAt`, `deletedAt`, `revision`); every
//! other field is application data and is merged field by field.

use crate::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names with meaning to the replica.
pub mod fields {
    pub const ID: &str = "id";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const DELETED_AT: &str = "deletedAt";
    pub const REVISION: &str = "revision";
}

/// Origin of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Made by application code on this replica
    Local,
    /// Received from upstream; never sent back out
    Remote,
}

/// Format a timestamp the way records store it (`2016-01-03T10:00:00.000Z`).
pub fn format_timestamp(ts: Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// A record in a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a JSON value. Returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// The record's identifier as a string key.
    ///
    /// String and integer ids are both accepted; integer ids come from
    /// auto-increment tables upstream.
    pub fn id(&self) -> Option<RecordId> {
        match self.fields.get(fields::ID)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether the record has an identifier yet.
    pub fn has_id(&self) -> bool {
        self.id().is_some()
    }

    pub fn set_id(&mut self, id: impl Into<RecordId>) {
        self.fields
            .insert(fields::ID.to_string(), Value::String(id.into()));
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Get a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Set a field value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Field-level merge: every field of `inbound` overwrites the same field
    /// here, fields absent from `inbound` are left alone.
    pub fn merge(&mut self, inbound: &Record) {
        for (field, value) in &inbound.fields {
            self.fields.insert(field.clone(), value.clone());
        }
    }

    /// Merge a set of loose fields, same rules as [`Record::merge`].
    pub fn merge_fields(&mut self, updates: Map<String, Value>) {
        for (field, value) in updates {
            self.fields.insert(field, value);
        }
    }

    pub fn deleted_at(&self) -> Option<&str> {
        self.get_str(fields::DELETED_AT)
    }

    /// Whether the record is a tombstone.
    pub fn is_deleted(&self) -> bool {
        !matches!(self.fields.get(fields::DELETED_AT), None | Some(Value::Null))
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.is_deleted()
    }

    /// Tombstone the record. An existing `deletedAt` is kept so repeated
    /// deletes do not move the timestamp.
    pub fn mark_deleted(&mut self, stamp: &str) {
        if !self.is_deleted() {
            self.set(fields::DELETED_AT, stamp);
        }
    }

    /// Clear the tombstone.
    pub fn restore(&mut self) {
        self.fields
            .insert(fields::DELETED_AT.to_string(), Value::Null);
    }

    pub fn created_at(&self) -> Option<&str> {
        self.get_str(fields::CREATED_AT)
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.get_str(fields::UPDATED_AT)
    }

    /// Stamp both creation and update times.
    pub fn stamp_created(&mut self, stamp: &str) {
        self.set(fields::CREATED_AT, stamp);
        self.set(fields::UPDATED_AT, stamp);
    }

    /// Stamp the update time.
    pub fn touch(&mut self, stamp: &str) {
        self.set(fields::UPDATED_AT, stamp);
    }

    /// Optimistic concurrency counter, if the collection carries one.
    pub fn revision(&self) -> Option<u64> {
        self.fields.get(fields::REVISION).and_then(Value::as_u64)
    }

    /// Iterate over all fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}
