//! The synchronized local database.
//!
//! [`SyncDb`] owns the store and the change emitter. Reads are plain
//! lookups; every write funnels through [`SyncDb::mutate`] so local changes
//! get timestamps, ids and an outbound message, and remote changes get none
//! of those.

use crate::{
    emitter::{ChangeEmitter, ChangeEvent, Mutation, Outbox, Scope, StoreAction, SubscriptionId},
    error::Result,
    message::ChangeMessage,
    query::Query,
    reconcile::{ReconcileOutcome, ReconcileReport, Reconciler},
    record::{fields, format_timestamp},
    Error, Origin, Record, RecordId, RecordStore, Schema, Snapshot, Timestamp,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Source of "now" for timestamps.
pub type Clock = Box<dyn Fn() -> Timestamp + Send + Sync>;

/// Options for [`SyncDb::mutate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutateOptions {
    /// The change came from upstream: keep its timestamps, do not send it
    pub remote: bool,
    /// Tombstone the record
    pub deleted: bool,
}

impl MutateOptions {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn remote() -> Self {
        Self {
            remote: true,
            deleted: false,
        }
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    fn origin(&self) -> Origin {
        if self.remote {
            Origin::Remote
        } else {
            Origin::Local
        }
    }
}

/// Generate an id for a new record: a lower-cased ULID, so ids sort by
/// creation time.
pub fn generate_id() -> RecordId {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// An in-memory replica of upstream collections.
pub struct SyncDb {
    store: RecordStore,
    emitter: ChangeEmitter,
    clock: Clock,
}

impl std::fmt::Debug for SyncDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDb")
            .field("store", &self.store)
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

impl SyncDb {
    /// Create an empty replica of the schema's collections.
    pub fn new(schema: Schema) -> Self {
        Self {
            store: RecordStore::new(schema),
            emitter: ChangeEmitter::new(),
            clock: Box::new(chrono::Utc::now),
        }
    }

    /// Replace the time source.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> Timestamp + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    /// Send local mutations upstream through `outbox`.
    pub fn attach(&mut self, outbox: Outbox) {
        self.emitter.attach(outbox);
    }

    pub fn detach(&mut self) -> Option<Outbox> {
        self.emitter.detach()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn now(&self) -> Timestamp {
        (self.clock)()
    }

    // ---- reads ----

    /// A live record by id.
    pub fn find(&self, collection: &str, id: &str) -> Option<&Record> {
        self.find_any(collection, id).filter(|r| r.is_active())
    }

    /// A record by id, tombstones included.
    pub fn find_any(&self, collection: &str, id: &str) -> Option<&Record> {
        self.store.get(collection, id)
    }

    /// Records matching the query, tombstones included.
    pub fn query(&self, collection: &str, query: &Query) -> Result<Vec<&Record>> {
        self.store.query(collection, query)
    }

    /// Live records matching the query.
    pub fn current(&self, collection: &str, query: Query) -> Result<Vec<&Record>> {
        self.store
            .query(collection, &query.is_null(fields::DELETED_AT))
    }

    /// Every live record in the collection.
    pub fn all(&self, collection: &str) -> Result<Vec<&Record>> {
        self.current(collection, Query::new())
    }

    // ---- writes ----

    /// Merge `changes` into a live record. `None` if the record is absent
    /// or deleted.
    pub fn update_fields(
        &mut self,
        collection: &str,
        id: &str,
        mut changes: Record,
    ) -> Result<Option<Mutation>> {
        let Some(mut record) = self.find(collection, id).cloned() else {
            debug!(collection = %collection, id = %id, "update of missing record skipped");
            return Ok(None);
        };
        changes.remove(fields::ID);
        record.merge(&changes);
        self.mutate(collection, record, MutateOptions::local()).map(Some)
    }

    /// Tombstone a record. Works on records already deleted; the original
    /// `deletedAt` is kept.
    pub fn delete_record(&mut self, collection: &str, id: &str) -> Result<Option<Mutation>> {
        let Some(record) = self.find_any(collection, id).cloned() else {
            debug!(collection = %collection, id = %id, "delete of missing record skipped");
            return Ok(None);
        };
        self.mutate(collection, record, MutateOptions::local().deleted())
            .map(Some)
    }

    /// Create a new record with a generated id.
    pub fn create(&mut self, collection: &str, mut values: Record) -> Result<Mutation> {
        values.remove(fields::ID);
        self.mutate(collection, values, MutateOptions::local())
    }

    /// The single write path.
    ///
    /// A record without an id, or with an id the store does not hold, is
    /// inserted (a missing id is generated). Otherwise it is merged onto the
    /// stored record. Local writes are stamped; remote writes keep whatever
    /// timestamps they carry.
    pub fn mutate(
        &mut self,
        collection: &str,
        mut record: Record,
        options: MutateOptions,
    ) -> Result<Mutation> {
        if self.store.collection(collection).is_none() {
            return Err(Error::CollectionNotFound(collection.to_string()));
        }
        let now = format_timestamp(self.now());
        let existing = record
            .id()
            .and_then(|id| self.store.get(collection, &id).cloned());

        let action = match existing {
            Some(mut stored) => {
                stored.merge(&record);
                record = stored;
                if !options.remote {
                    record.touch(&now);
                }
                if options.deleted {
                    StoreAction::Delete
                } else {
                    StoreAction::Update
                }
            }
            None => {
                if !record.has_id() {
                    record.set_id(generate_id());
                }
                if !options.remote {
                    record.stamp_created(&now);
                }
                if record.get(fields::DELETED_AT).is_none() {
                    record.set(fields::DELETED_AT, Value::Null);
                }
                StoreAction::Insert
            }
        };
        if options.deleted {
            record.mark_deleted(&now);
        }

        self.emitter
            .apply(&mut self.store, collection, action, record, options.origin())
    }

    // ---- listeners ----

    pub fn subscribe<F>(&mut self, scope: impl Into<Scope>, listener: F) -> SubscriptionId
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        self.emitter.subscribe(scope, listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    // ---- replication ----

    /// Replace all state with a snapshot fetched from upstream.
    pub fn load(&mut self, snapshot: Snapshot) -> Result<()> {
        let count = snapshot.record_count();
        self.store.load(snapshot)?;
        debug!(records = count, "snapshot loaded");
        Ok(())
    }

    pub fn export(&self) -> Snapshot {
        self.store.export()
    }

    fn reconciler(&mut self) -> Reconciler<'_> {
        let now = self.now();
        Reconciler::new(&mut self.store, &mut self.emitter, now)
    }

    /// Apply a decoded inbound change.
    pub fn apply_remote(&mut self, message: ChangeMessage) -> Result<ReconcileOutcome> {
        self.reconciler().apply(message)
    }

    /// Apply a raw inbound payload; malformed payloads are dropped.
    pub fn receive(&mut self, raw: Value) -> Option<ReconcileOutcome> {
        self.reconciler().receive(raw)
    }

    /// Apply raw inbound payloads in order.
    pub fn apply_batch(&mut self, batch: impl IntoIterator<Item = Value>) -> ReconcileReport {
        self.reconciler().apply_batch(batch)
    }

    /// Apply every message the channel pump has forwarded so far, without
    /// waiting for more.
    pub fn drain(&mut self, inbound: &mut mpsc::UnboundedReceiver<ChangeMessage>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        while let Ok(message) = inbound.try_recv() {
            match self.apply_remote(message) {
                Ok(ReconcileOutcome::Ignored { .. }) => report.ignored += 1,
                Ok(_) => report.applied += 1,
                Err(e) => {
                    warn!(error = %e, "dropping acknowledgment");
                    report.dropped += 1;
                }
            }
        }
        report
    }
}
