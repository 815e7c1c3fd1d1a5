//! Collection definitions.
//!
//! A schema names the collections a replica mirrors and, per collection, the
//! fields to index, the fields that must be unique among live records, and
//! whether upstream guards updates with a `revision` counter.

use crate::{record::fields, CollectionName, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Definition of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDef {
    /// Collection name
    pub name: CollectionName,
    /// Fields with a secondary index
    #[serde(default)]
    pub indices: Vec<String>,
    /// Fields that together identify a live record upstream
    #[serde(default)]
    pub unique: Vec<String>,
    /// Whether updates carry a `revision` for optimistic concurrency
    #[serde(default)]
    pub revisioned: bool,
}

impl CollectionDef {
    /// A collection with no indices or constraints.
    pub fn new(name: impl Into<CollectionName>) -> Self {
        Self {
            name: name.into(),
            indices: Vec::new(),
            unique: Vec::new(),
            revisioned: false,
        }
    }

    pub fn indexed<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn unique<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn revisioned(mut self) -> Self {
        self.revisioned = true;
        self
    }

    /// Key over the unique fields, or `None` when the collection has no
    /// unique fields or one of them is unset.
    ///
    /// The key is the JSON array of the field values, so no value can bleed
    /// into its neighbour.
    pub fn unique_key(&self, record: &Record) -> Option<String> {
        if self.unique.is_empty() {
            return None;
        }
        let parts = self
            .unique
            .iter()
            .map(|field| record.get(field).filter(|v| !v.is_null()))
            .collect::<Option<Vec<&Value>>>()?;
        serde_json::to_string(&parts).ok()
    }
}

/// The set of collections a replica mirrors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub collections: BTreeMap<CollectionName, CollectionDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, def: CollectionDef) -> &mut Self {
        self.collections.insert(def.name.clone(), def);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, def: CollectionDef) -> Self {
        self.add_collection(def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.get(name)
    }

    /// Definition for a collection, falling back to an unindexed one for
    /// collections only known from a snapshot.
    pub fn def_or_default(&self, name: &str) -> CollectionDef {
        self.get(name)
            .cloned()
            .unwrap_or_else(|| CollectionDef::new(name))
    }

    /// The congregation class-scheduling collections.
    pub fn congregation() -> Self {
        let deleted = fields::DELETED_AT;
        Schema::new()
            .with_collection(CollectionDef::new("divisionConfigs").indexed([deleted]))
            .with_collection(CollectionDef::new("divisionYears").indexed([
                "divisionConfigId",
                "startDate",
                "endDate",
                deleted,
            ]))
            .with_collection(CollectionDef::new("divisions").indexed([
                "divisionConfigId",
                "divisionYear",
                "start",
                "end",
                deleted,
            ]))
            .with_collection(CollectionDef::new("classes").indexed([deleted]))
            .with_collection(
                CollectionDef::new("classMeetingDays").indexed(["divisionConfigId", deleted]),
            )
            .with_collection(
                CollectionDef::new("divisionClasses").indexed(["classId", "divisionId", deleted]),
            )
            .with_collection(
                CollectionDef::new("divisionClassTeachers")
                    .indexed(["divisionClassId", "day", deleted])
                    .unique(["divisionClassId", "day", "peopleId"]),
            )
            .with_collection(
                CollectionDef::new("divisionClassAttendance")
                    .indexed(["divisionClassId", "day", "attendanceDate", deleted])
                    .unique(["divisionClassId", "day", "attendanceDate"]),
            )
            .with_collection(CollectionDef::new("people").indexed([deleted]).revisioned())
            .with_collection(
                CollectionDef::new("students")
                    .indexed(["peopleId", deleted])
                    .unique(["peopleId"])
                    .revisioned(),
            )
            .with_collection(
                CollectionDef::new("teachers")
                    .indexed(["peopleId", deleted])
                    .unique(["peopleId"])
                    .revisioned(),
            )
            .with_collection(CollectionDef::new("users").revisioned())
    }
}
