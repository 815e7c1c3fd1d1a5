//! Reconciliation of inbound change messages.
//!
//! This is what keeps a replica converging on upstream. Every inbound message
//! is merged field by field into the local store, never replacing a record
//! wholesale, and every mutation made here is tagged remote so it is not
//! sent back out.
//!
//! # Algorithm
//!
//! 1. Drop messages with no collection, no record id, or an unknown
//!    collection
//! 2. Unique-constraint error: tombstone the prior record, then merge the
//!    canonical record and make it live
//! 3. Insert acknowledgment under a new id: move the optimistic record to
//!    the canonical id
//! 4. Otherwise merge by id; a delete stamps `deletedAt`, insert and update
//!    clear it; a delete of an unknown record is a no-op

use crate::{
    emitter::{ChangeEmitter, StoreAction},
    error::Result,
    message::{ChangeMessage, ChangeType},
    record::{fields, format_timestamp},
    Error, Origin, Record, RecordId, RecordStore, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// What applying one message did to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ReconcileOutcome {
    /// A record unknown locally was inserted
    Inserted { id: RecordId },
    /// Inbound fields were merged onto the local record
    Merged { id: RecordId },
    /// The local record was tombstoned
    Deleted { id: RecordId },
    /// The optimistic record under `from` now lives under `to`
    Rekeyed { from: RecordId, to: RecordId },
    /// A unique-constraint collision was resolved onto the canonical record
    Resolved {
        tombstoned: Option<RecordId>,
        canonical: RecordId,
    },
    /// Nothing to do (delete of a record we never had)
    Ignored { id: RecordId },
}

/// Counts for a batch of inbound messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Messages that changed the store
    pub applied: usize,
    /// Well-formed messages with nothing to do
    pub ignored: usize,
    /// Malformed messages, dropped with a warning
    pub dropped: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.applied + self.ignored + self.dropped
    }

    fn record(&mut self, outcome: Option<&ReconcileOutcome>) {
        match outcome {
            Some(ReconcileOutcome::Ignored { .. }) => self.ignored += 1,
            Some(_) => self.applied += 1,
            None => self.dropped += 1,
        }
    }
}

/// Applies inbound change messages to a store.
pub struct Reconciler<'a> {
    store: &'a mut RecordStore,
    emitter: &'a mut ChangeEmitter,
    /// Stamp used when a delete carries no `deletedAt` of its own
    now: String,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a mut RecordStore, emitter: &'a mut ChangeEmitter, now: Timestamp) -> Self {
        Self {
            store,
            emitter,
            now: format_timestamp(now),
        }
    }

    /// Decode and apply a raw inbound payload. Malformed payloads are
    /// logged and dropped.
    pub fn receive(&mut self, raw: Value) -> Option<ReconcileOutcome> {
        match ChangeMessage::from_value(raw).and_then(|message| self.apply(message)) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "dropping inbound change");
                None
            }
        }
    }

    /// Apply a batch of raw payloads in order.
    pub fn apply_batch(&mut self, batch: impl IntoIterator<Item = Value>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for raw in batch {
            let outcome = self.receive(raw);
            report.record(outcome.as_ref());
        }
        report
    }

    /// Apply one decoded message.
    pub fn apply(&mut self, message: ChangeMessage) -> Result<ReconcileOutcome> {
        message.validate()?;
        if self.store.collection(&message.collection).is_none() {
            return Err(Error::MalformedMessage(format!(
                "unknown collection {}",
                message.collection
            )));
        }

        if let Some(error) = &message.error {
            // only two creates can collide; a refused update leaves its
            // record live upstream
            if error.is_unique_violation() && message.kind == ChangeType::Insert {
                return self.resolve_conflict(message);
            }
            warn!(
                collection = %message.collection,
                id = ?message.record.id(),
                error = %error.name,
                message = ?error.message,
                "upstream rejected change, taking its record"
            );
            return self.merge(message);
        }

        match rekeyed_prior(&message) {
            Some(prior_id) => self.rekey(message, prior_id),
            None => self.merge(message),
        }
    }

    /// Normal path: merge by id.
    fn merge(&mut self, message: ChangeMessage) -> Result<ReconcileOutcome> {
        let ChangeMessage {
            kind,
            collection,
            record: inbound,
            ..
        } = message;
        let id = inbound
            .id()
            .ok_or_else(|| Error::MissingId(collection.clone()))?;

        let Some(mut existing) = self.store.get(&collection, &id).cloned() else {
            if kind == ChangeType::Delete {
                debug!(collection = %collection, id = %id, "delete for unknown record");
                return Ok(ReconcileOutcome::Ignored { id });
            }
            let mut fresh = inbound;
            fresh.restore();
            self.emit(&collection, StoreAction::Insert, fresh)?;
            return Ok(ReconcileOutcome::Inserted { id });
        };

        let stamp = deletion_stamp(&inbound, &existing, &self.now);
        existing.merge(&inbound);
        if kind == ChangeType::Delete {
            existing.set(fields::DELETED_AT, stamp);
            self.emit(&collection, StoreAction::Delete, existing)?;
            Ok(ReconcileOutcome::Deleted { id })
        } else {
            existing.restore();
            self.emit(&collection, StoreAction::Update, existing)?;
            Ok(ReconcileOutcome::Merged { id })
        }
    }

    /// Two writers created logically-equivalent records and upstream kept
    /// one. Tombstone ours, converge on theirs.
    fn resolve_conflict(&mut self, message: ChangeMessage) -> Result<ReconcileOutcome> {
        let ChangeMessage {
            collection,
            record: canonical,
            prior,
            ..
        } = message;
        let canonical_id = canonical
            .id()
            .ok_or_else(|| Error::MissingId(collection.clone()))?;

        let mut tombstoned = None;
        let prior_id = prior.as_ref().and_then(Record::id);
        if let Some(prior_id) = prior_id.filter(|id| *id != canonical_id) {
            if let Some(mut local) = self.store.get(&collection, &prior_id).cloned() {
                local.mark_deleted(&self.now);
                self.emit(&collection, StoreAction::Delete, local)?;
                tombstoned = Some(prior_id);
            }
        }

        match self.store.get(&collection, &canonical_id).cloned() {
            Some(mut existing) => {
                existing.merge(&canonical);
                existing.restore();
                self.emit(&collection, StoreAction::Update, existing)?;
            }
            None => {
                let mut fresh = canonical;
                fresh.restore();
                self.emit(&collection, StoreAction::Insert, fresh)?;
            }
        }

        debug!(
            collection = %collection,
            canonical = %canonical_id,
            tombstoned = ?tombstoned,
            "unique conflict resolved"
        );
        Ok(ReconcileOutcome::Resolved {
            tombstoned,
            canonical: canonical_id,
        })
    }

    /// Upstream assigned a different id to one of our inserts. The
    /// optimistic row goes away and its fields live on under the canonical
    /// ones.
    fn rekey(&mut self, message: ChangeMessage, prior_id: RecordId) -> Result<ReconcileOutcome> {
        let ChangeMessage {
            collection,
            record: canonical,
            ..
        } = message;
        let canonical_id = canonical
            .id()
            .ok_or_else(|| Error::MissingId(collection.clone()))?;

        let mut merged = if self.store.get(&collection, &prior_id).is_some() {
            let stub = Record::new().with(fields::ID, prior_id.clone());
            self.emit(&collection, StoreAction::Remove, stub)?
        } else {
            Record::new()
        };

        let action = match self.store.get(&collection, &canonical_id) {
            Some(existing) => {
                merged.merge(existing);
                StoreAction::Update
            }
            None => StoreAction::Insert,
        };
        merged.merge(&canonical);
        merged.restore();
        self.emit(&collection, action, merged)?;

        debug!(collection = %collection, from = %prior_id, to = %canonical_id, "record rekeyed");
        Ok(ReconcileOutcome::Rekeyed {
            from: prior_id,
            to: canonical_id,
        })
    }

    fn emit(&mut self, collection: &str, action: StoreAction, record: Record) -> Result<Record> {
        self.emitter
            .apply(self.store, collection, action, record, Origin::Remote)
            .map(|mutation| mutation.record)
    }
}

/// Id of the optimistic record an insert acknowledgment answers, when
/// upstream stored it under a different id.
fn rekeyed_prior(message: &ChangeMessage) -> Option<RecordId> {
    if message.kind != ChangeType::Insert {
        return None;
    }
    let prior_id = message.prior.as_ref()?.id()?;
    if message.record.id().as_deref() == Some(prior_id.as_str()) {
        None
    } else {
        Some(prior_id)
    }
}

/// `deletedAt` for a delete: the inbound stamp, else the existing one, else
/// now.
fn deletion_stamp(inbound: &Record, existing: &Record, now: &str) -> Value {
    [inbound, existing]
        .into_iter()
        .find(|r| r.is_deleted())
        .and_then(|r| r.get(fields::DELETED_AT).cloned())
        .unwrap_or_else(|| Value::String(now.to_string()))
}
