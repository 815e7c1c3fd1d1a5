//! Snapshot types for seeding and exporting store state.
//!
//! A replica is rebuilt from a full snapshot fetched at session start. The
//! same type is what upstream serves, so it is designed for deterministic
//! serialization.

use crate::{error::Result, CollectionName, Error, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of every collection.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
/// Records keep their insertion order within a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// All records organized by collection, tombstones included
    pub collections: BTreeMap<CollectionName, Vec<Record>>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            collections: BTreeMap::new(),
        }
    }

    /// Declare a collection, even if it has no records yet.
    pub fn add_collection(&mut self, name: impl Into<CollectionName>) {
        self.collections.entry(name.into()).or_default();
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, collection: impl Into<CollectionName>, record: Record) {
        self.collections
            .entry(collection.into())
            .or_default()
            .push(record);
    }

    /// Get a record from the snapshot.
    pub fn get_record(&self, collection: &str, id: &str) -> Option<&Record> {
        self.collections
            .get(collection)?
            .iter()
            .find(|r| r.id().as_deref() == Some(id))
    }

    /// Count total records across all collections.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.collections
            .values()
            .flatten()
            .filter(|r| r.is_active())
            .count()
    }

    /// Every record must have an id, unique within its collection.
    pub fn validate(&self) -> Result<()> {
        for (name, records) in &self.collections {
            let mut seen = HashSet::with_capacity(records.len());
            for record in records {
                let id = record.id().ok_or_else(|| {
                    Error::InvalidSnapshot(format!("record without id in {}", name))
                })?;
                if !seen.insert(id.clone()) {
                    return Err(Error::InvalidSnapshot(format!(
                        "duplicate id {} in {}",
                        id, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
