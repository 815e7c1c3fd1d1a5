//! Store - the in-memory state container.
//!
//! The store holds one indexed collection per entity type. It enforces the
//! primary-key contract (one record per id) and keeps every secondary index
//! in step with the records on each mutation. It knows nothing about
//! listeners or upstream; see [`crate::emitter`] for that.

use crate::{
    error::Result,
    query::{Clause, IndexKey, Query},
    schema::CollectionDef,
    CollectionName, Error, Record, RecordId, Schema, Snapshot,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Secondary index over one field: key -> insertion sequence numbers.
#[derive(Debug, Clone, Default)]
struct FieldIndex {
    entries: BTreeMap<IndexKey, BTreeSet<u64>>,
}

impl FieldIndex {
    fn add(&mut self, field: &str, record: &Record, seq: u64) {
        if let Some(key) = IndexKey::from_value(record.get(field)) {
            self.entries.entry(key).or_default().insert(seq);
        }
    }

    fn drop_entry(&mut self, field: &str, record: &Record, seq: u64) {
        let Some(key) = IndexKey::from_value(record.get(field)) else {
            return;
        };
        if let Some(seqs) = self.entries.get_mut(&key) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    fn lookup(&self, key: &IndexKey) -> BTreeSet<u64> {
        self.entries.get(key).cloned().unwrap_or_default()
    }
}

/// A collection of records.
#[derive(Debug, Clone)]
pub struct Collection {
    def: CollectionDef,
    /// Records by insertion sequence, which is also iteration order
    records: BTreeMap<u64, Record>,
    /// Primary key -> sequence
    ids: HashMap<RecordId, u64>,
    indices: HashMap<String, FieldIndex>,
    next_seq: u64,
}

impl Collection {
    /// Create an empty collection.
    pub fn new(def: CollectionDef) -> Self {
        let indices = def
            .indices
            .iter()
            .map(|field| (field.clone(), FieldIndex::default()))
            .collect();
        Self {
            def,
            records: BTreeMap::new(),
            ids: HashMap::new(),
            indices,
            next_seq: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &CollectionDef {
        &self.def
    }

    /// Get a record by ID, tombstones included.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.ids.get(id).and_then(|seq| self.records.get(seq))
    }

    /// Check if a record exists (including deleted).
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    /// Get all records including deleted, in insertion order.
    pub fn all_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Get all active (non-deleted) records.
    pub fn active_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.is_active())
    }

    /// Count of all records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a field has a secondary index.
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indices.contains_key(field)
    }

    /// Records matching every clause, in insertion order.
    pub fn query(&self, query: &Query) -> Vec<&Record> {
        match self.plan(query) {
            Some(seqs) => seqs
                .iter()
                .filter_map(|seq| self.records.get(seq))
                .filter(|r| query.matches(r))
                .collect(),
            None => self.records.values().filter(|r| query.matches(r)).collect(),
        }
    }

    /// Candidate set from the narrowest usable index, if any clause can use
    /// one.
    fn plan(&self, query: &Query) -> Option<BTreeSet<u64>> {
        query
            .clauses()
            .iter()
            .filter_map(|clause| {
                let (field, key) = match clause {
                    Clause::Eq(field, value) => (field, IndexKey::from_value(Some(value))?),
                    Clause::IsNull(field) => (field, IndexKey::Null),
                    _ => return None,
                };
                Some(self.indices.get(field)?.lookup(&key))
            })
            .min_by_key(BTreeSet::len)
    }

    fn insert(&mut self, record: Record) -> Result<&Record> {
        let id = record
            .id()
            .ok_or_else(|| Error::MissingId(self.def.name.clone()))?;
        if self.ids.contains_key(&id) {
            return Err(Error::duplicate(&self.def.name, &id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        for (field, index) in self.indices.iter_mut() {
            index.add(field, &record, seq);
        }
        self.ids.insert(id, seq);
        Ok(self.records.entry(seq).or_insert(record))
    }

    fn update(&mut self, record: Record) -> Result<&Record> {
        let id = record
            .id()
            .ok_or_else(|| Error::MissingId(self.def.name.clone()))?;
        let seq = *self
            .ids
            .get(&id)
            .ok_or_else(|| Error::not_found(&self.def.name, &id))?;

        if let Some(previous) = self.records.get(&seq) {
            for (field, index) in self.indices.iter_mut() {
                index.drop_entry(field, previous, seq);
                index.add(field, &record, seq);
            }
        }
        self.records.insert(seq, record);
        self.records
            .get(&seq)
            .ok_or_else(|| Error::not_found(&self.def.name, &id))
    }

    fn remove(&mut self, id: &str) -> Result<Record> {
        let seq = self
            .ids
            .remove(id)
            .ok_or_else(|| Error::not_found(&self.def.name, id))?;
        let record = self
            .records
            .remove(&seq)
            .ok_or_else(|| Error::not_found(&self.def.name, id))?;
        for (field, index) in self.indices.iter_mut() {
            index.drop_entry(field, &record, seq);
        }
        Ok(record)
    }

    fn clear(&mut self) {
        self.records.clear();
        self.ids.clear();
        for index in self.indices.values_mut() {
            index.entries.clear();
        }
    }
}

/// The record store: one collection per entity type.
#[derive(Debug, Clone)]
pub struct RecordStore {
    schema: Schema,
    collections: HashMap<CollectionName, Collection>,
}

impl RecordStore {
    /// Create a store with an empty collection for every schema entry.
    pub fn new(schema: Schema) -> Self {
        let collections = schema
            .collections
            .values()
            .map(|def| (def.name.clone(), Collection::new(def.clone())))
            .collect();
        Self {
            schema,
            collections,
        }
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get a collection by name.
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    /// Names of all collections, sorted.
    pub fn collection_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Create the collection if it does not exist yet, using the schema's
    /// definition when there is one.
    pub fn ensure_collection(&mut self, name: &str) -> &mut Collection {
        let def = self.schema.def_or_default(name);
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Collection::new(def))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Get a record by collection and ID, tombstones included.
    pub fn get(&self, collection: &str, id: &str) -> Option<&Record> {
        self.collections.get(collection)?.get(id)
    }

    /// Query records in a collection.
    pub fn query(&self, collection: &str, query: &Query) -> Result<Vec<&Record>> {
        self.collections
            .get(collection)
            .map(|c| c.query(query))
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    /// Insert a new record. Fails if the id is already present.
    pub fn insert(&mut self, collection: &str, record: Record) -> Result<&Record> {
        self.collection_mut(collection)?.insert(record)
    }

    /// Replace an existing record. Fails if the id is absent.
    pub fn update(&mut self, collection: &str, record: Record) -> Result<&Record> {
        self.collection_mut(collection)?.update(record)
    }

    /// Physically delete a record.
    pub fn remove(&mut self, collection: &str, id: &str) -> Result<Record> {
        self.collection_mut(collection)?.remove(id)
    }

    /// Replace all state with a snapshot. Collections in the snapshot that
    /// the schema does not declare are created unindexed.
    pub fn load(&mut self, snapshot: Snapshot) -> Result<()> {
        snapshot.validate()?;

        for collection in self.collections.values_mut() {
            collection.clear();
        }
        for (name, records) in snapshot.collections {
            let collection = self.ensure_collection(&name);
            for record in records {
                collection.insert(record)?;
            }
        }
        Ok(())
    }

    /// Export the current store state as a snapshot.
    pub fn export(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for (name, collection) in &self.collections {
            snapshot.add_collection(name.clone());
            for record in collection.all_records() {
                snapshot.add_record(name.clone(), record.clone());
            }
        }
        snapshot
    }

    /// Count of records across all collections.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Collection::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn test_schema() -> Schema {
        Schema::new().with_collection(
            CollectionDef::new("divisionClasses").indexed(["classId", "divisionId", "deletedAt"]),
        )
    }

    fn test_store() -> RecordStore {
        RecordStore::new(test_schema())
    }

    #[test]
    fn create_store() {
        let store = test_store();
        assert!(store.collection("divisionClasses").is_some());
        assert!(store.collection("divisionClasses").unwrap().is_indexed("classId"));
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn insert_and_get() {
        let mut store = test_store();
        store
            .insert("divisionClasses", record(json!({"id": "dc-1", "classId": "c1"})))
            .unwrap();

        let found = store.get("divisionClasses", "dc-1").unwrap();
        assert_eq!(found.get_str("classId"), Some("c1"));
        assert!(store.get("divisionClasses", "dc-2").is_none());
        assert!(store.get("nope", "dc-1").is_none());
    }

    #[test]
    fn insert_duplicate() {
        let mut store = test_store();
        store
            .insert("divisionClasses", record(json!({"id": "dc-1"})))
            .unwrap();

        let result = store.insert("divisionClasses", record(json!({"id": "dc-1"})));
        assert!(matches!(result, Err(Error::DuplicateId { id, .. }) if id == "dc-1"));
    }

    #[test]
    fn insert_without_id() {
        let mut store = test_store();
        let result = store.insert("divisionClasses", record(json!({"classId": "c1"})));
        assert!(matches!(result, Err(Error::MissingId(_))));
    }

    #[test]
    fn unknown_collection() {
        let mut store = test_store();
        let result = store.insert("attendance", record(json!({"id": "a"})));
        assert!(matches!(result, Err(Error::CollectionNotFound(c)) if c == "attendance"));
        assert!(store.query("attendance", &Query::new()).is_err());
    }

    #[test]
    fn update_missing() {
        let mut store = test_store();
        let result = store.update("divisionClasses", record(json!({"id": "dc-1"})));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn update_reindexes() {
        let mut store = test_store();
        store
            .insert("divisionClasses", record(json!({"id": "dc-1", "classId": "c1"})))
            .unwrap();
        store
            .update("divisionClasses", record(json!({"id": "dc-1", "classId": "c2"})))
            .unwrap();

        let by_old = store
            .query("divisionClasses", &Query::new().eq("classId", "c1"))
            .unwrap();
        assert!(by_old.is_empty());

        let by_new = store
            .query("divisionClasses", &Query::new().eq("classId", "c2"))
            .unwrap();
        assert_eq!(by_new.len(), 1);
    }

    #[test]
    fn remove_drops_index_entries() {
        let mut store = test_store();
        store
            .insert("divisionClasses", record(json!({"id": "dc-1", "classId": "c1"})))
            .unwrap();
        let removed = store.remove("divisionClasses", "dc-1").unwrap();
        assert_eq!(removed.id().as_deref(), Some("dc-1"));

        assert!(store.get("divisionClasses", "dc-1").is_none());
        assert!(store
            .query("divisionClasses", &Query::new().eq("classId", "c1"))
            .unwrap()
            .is_empty());
        assert!(matches!(
            store.remove("divisionClasses", "dc-1"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn query_keeps_insertion_order() {
        let mut store = test_store();
        for id in ["dc-3", "dc-1", "dc-2"] {
            store
                .insert(
                    "divisionClasses",
                    record(json!({"id": id, "divisionId": "d1", "deletedAt": null})),
                )
                .unwrap();
        }
        // an update keeps the record's position
        store
            .update(
                "divisionClasses",
                record(json!({"id": "dc-3", "divisionId": "d1", "deletedAt": null, "room": 4})),
            )
            .unwrap();

        let ids: Vec<_> = store
            .query("divisionClasses", &Query::active().eq("divisionId", "d1"))
            .unwrap()
            .into_iter()
            .filter_map(Record::id)
            .collect();
        assert_eq!(ids, vec!["dc-3", "dc-1", "dc-2"]);
    }

    #[test]
    fn indexed_and_scanned_queries_agree() {
        let mut store = test_store();
        for i in 0..20 {
            store
                .insert(
                    "divisionClasses",
                    record(json!({
                        "id": format!("dc-{}", i),
                        "classId": format!("c{}", i % 3),
                        "room": i % 4,
                    })),
                )
                .unwrap();
        }
        let indexed = store
            .query("divisionClasses", &Query::new().eq("classId", "c1").eq("room", 1))
            .unwrap();
        let scanned: Vec<_> = store
            .collection("divisionClasses")
            .unwrap()
            .all_records()
            .filter(|r| r.get_str("classId") == Some("c1") && r.get("room") == Some(&json!(1)))
            .collect();
        assert_eq!(indexed, scanned);
    }

    #[test]
    fn active_query_uses_deleted_index() {
        let mut store = test_store();
        store
            .insert("divisionClasses", record(json!({"id": "a", "deletedAt": null})))
            .unwrap();
        store
            .insert(
                "divisionClasses",
                record(json!({"id": "b", "deletedAt": "2016-01-01T00:00:00.000Z"})),
            )
            .unwrap();
        store
            .insert("divisionClasses", record(json!({"id": "c"})))
            .unwrap();

        let active = store.query("divisionClasses", &Query::active()).unwrap();
        let ids: Vec<_> = active.into_iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn load_and_export() {
        let mut snapshot = Snapshot::new();
        snapshot.add_record("divisionClasses", record(json!({"id": "dc-1", "classId": "c1"})));
        snapshot.add_record("notes", record(json!({"id": "n1", "text": "hello"})));

        let mut store = test_store();
        store
            .insert("divisionClasses", record(json!({"id": "stale"})))
            .unwrap();
        store.load(snapshot).unwrap();

        assert!(store.get("divisionClasses", "stale").is_none());
        assert!(store.get("divisionClasses", "dc-1").is_some());
        // collections only known from the snapshot are created
        assert!(store.get("notes", "n1").is_some());

        let exported = store.export();
        assert_eq!(exported.record_count(), 2);
        assert!(exported.get_record("notes", "n1").is_some());
    }

    #[test]
    fn load_rejects_invalid_snapshot() {
        let mut snapshot = Snapshot::new();
        snapshot.add_record("divisionClasses", record(json!({"id": "dc-1"})));
        snapshot.add_record("divisionClasses", record(json!({"id": "dc-1"})));

        let mut store = test_store();
        assert!(matches!(store.load(snapshot), Err(Error::InvalidSnapshot(_))));
    }
}
