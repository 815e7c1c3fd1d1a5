//! Change emitter - the single path through which the store is mutated.
//!
//! Every mutation goes to the store first, then to listeners, then (for
//! local mutations with an outbox attached) upstream. Remote mutations are
//! never queued, which is what keeps replication from echoing.

use crate::{
    error::Result,
    message::{ChangeMessage, ChangeType, OutboundChange},
    CollectionName, Error, Origin, Record, RecordStore,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// What to do with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    /// Add a new record
    Insert,
    /// Replace an existing record
    Update,
    /// Replace an existing record with its tombstone
    Delete,
    /// Physically drop the record
    Remove,
}

impl StoreAction {
    /// Change type reported to listeners and upstream.
    pub fn change_type(&self) -> ChangeType {
        match self {
            StoreAction::Insert => ChangeType::Insert,
            StoreAction::Update => ChangeType::Update,
            StoreAction::Delete | StoreAction::Remove => ChangeType::Delete,
        }
    }
}

/// Notification delivered to listeners after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub kind: ChangeType,
    /// The record as stored (or as it was, for a removal)
    pub record: Record,
    pub origin: Origin,
}

/// Handle returned by [`ChangeEmitter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Collections a listener hears about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Collection(CollectionName),
}

impl Scope {
    fn covers(&self, collection: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Collection(name) => name == collection,
        }
    }
}

impl From<&str> for Scope {
    fn from(collection: &str) -> Self {
        Scope::Collection(collection.to_string())
    }
}

pub type Listener = Box<dyn FnMut(&ChangeEvent) + Send>;

/// Result of the upstream write, as seen by the mutating caller.
pub type DeliveryResult = Result<Option<ChangeMessage>>;

/// An outbound change on its way to the channel pump.
#[derive(Debug)]
pub struct Envelope {
    pub change: OutboundChange,
    pub reply: oneshot::Sender<DeliveryResult>,
}

/// Completion handle of one outbound change.
///
/// Dropping it is fine; the change is still sent.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<DeliveryResult>,
}

impl Delivery {
    /// Wait for upstream to acknowledge the change. Yields the decoded
    /// acknowledgment, which may itself carry an upstream error.
    pub async fn landed(self) -> DeliveryResult {
        self.rx.await.map_err(|_| Error::DeliveryDropped)?
    }
}

/// Sending half of the queue between the db owner and the channel pump.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Create an outbox and the receiver the channel pump drains.
pub fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, rx)
}

impl Outbox {
    /// Queue a change. If the pump is gone the delivery resolves to
    /// [`Error::DeliveryDropped`].
    pub fn push(&self, change: OutboundChange) -> Delivery {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(envelope)) = self.tx.send(Envelope { change, reply }) {
            warn!(
                collection = %envelope.change.collection,
                kind = %envelope.change.kind,
                "outbox closed, change not sent"
            );
        }
        Delivery { rx }
    }
}

/// Outcome of one mutation through the emitter.
#[derive(Debug)]
pub struct Mutation {
    pub kind: ChangeType,
    /// The record as stored after the mutation
    pub record: Record,
    /// Present for local mutations when an outbox is attached
    pub delivery: Option<Delivery>,
}

/// Wraps store mutations with notification and outbound queuing.
#[derive(Default)]
pub struct ChangeEmitter {
    listeners: Vec<(SubscriptionId, Scope, Listener)>,
    next_id: u64,
    outbox: Option<Outbox>,
}

impl std::fmt::Debug for ChangeEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEmitter")
            .field("listeners", &self.listeners.len())
            .field("outbox", &self.outbox.is_some())
            .finish()
    }
}

impl ChangeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send local mutations upstream through this outbox from now on.
    pub fn attach(&mut self, outbox: Outbox) {
        self.outbox = Some(outbox);
    }

    /// Stop queuing local mutations.
    pub fn detach(&mut self) -> Option<Outbox> {
        self.outbox.take()
    }

    pub fn is_attached(&self) -> bool {
        self.outbox.is_some()
    }

    /// Register a listener. Listeners run synchronously, in subscription
    /// order, after the store has been mutated.
    pub fn subscribe<F>(&mut self, scope: impl Into<Scope>, listener: F) -> SubscriptionId
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, scope.into(), Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sub, _, _)| *sub != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Mutate the store, notify listeners, and queue the change upstream
    /// when it is local.
    ///
    /// For [`StoreAction::Remove`] only the record's id is used.
    pub fn apply(
        &mut self,
        store: &mut RecordStore,
        collection: &str,
        action: StoreAction,
        record: Record,
        origin: Origin,
    ) -> Result<Mutation> {
        let stored = match action {
            StoreAction::Insert => store.insert(collection, record)?.clone(),
            StoreAction::Update | StoreAction::Delete => store.update(collection, record)?.clone(),
            StoreAction::Remove => {
                let id = record
                    .id()
                    .ok_or_else(|| Error::MissingId(collection.to_string()))?;
                store.remove(collection, &id)?
            }
        };
        let kind = action.change_type();
        debug!(
            collection = %collection,
            id = ?stored.id(),
            kind = %kind,
            origin = ?origin,
            "record mutated"
        );

        let event = ChangeEvent {
            collection: collection.to_string(),
            kind,
            record: stored,
            origin,
        };
        for (_, scope, listener) in self.listeners.iter_mut() {
            if scope.covers(collection) {
                listener(&event);
            }
        }

        let delivery = match (&self.outbox, origin) {
            (Some(outbox), Origin::Local) => Some(outbox.push(OutboundChange::new(
                kind,
                collection,
                event.record.clone(),
            ))),
            _ => None,
        };

        Ok(Mutation {
            kind,
            record: event.record,
            delivery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionDef, Schema};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn test_store() -> RecordStore {
        RecordStore::new(
            Schema::new()
                .with_collection(CollectionDef::new("classes"))
                .with_collection(CollectionDef::new("students")),
        )
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<ChangeEvent>>>, impl FnMut(&ChangeEvent) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.clone())
        })
    }

    #[test]
    fn listeners_see_mutation_after_store() {
        let mut store = test_store();
        let mut emitter = ChangeEmitter::new();
        let (seen, listener) = recorder();
        emitter.subscribe(Scope::All, listener);

        emitter
            .apply(
                &mut store,
                "classes",
                StoreAction::Insert,
                record(json!({"id": "C1", "title": "Math"})),
                Origin::Local,
            )
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ChangeType::Insert);
        assert_eq!(seen[0].origin, Origin::Local);
        assert!(store.get("classes", "C1").is_some());
    }

    #[test]
    fn collection_scoped_listener() {
        let mut store = test_store();
        let mut emitter = ChangeEmitter::new();
        let (seen, listener) = recorder();
        emitter.subscribe("students", listener);

        emitter
            .apply(
                &mut store,
                "classes",
                StoreAction::Insert,
                record(json!({"id": "C1"})),
                Origin::Local,
            )
            .unwrap();
        emitter
            .apply(
                &mut store,
                "students",
                StoreAction::Insert,
                record(json!({"id": "S1"})),
                Origin::Remote,
            )
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].collection, "students");
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let mut store = test_store();
        let mut emitter = ChangeEmitter::new();
        let (seen, listener) = recorder();
        let id = emitter.subscribe(Scope::All, listener);

        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter
            .apply(
                &mut store,
                "classes",
                StoreAction::Insert,
                record(json!({"id": "C1"})),
                Origin::Local,
            )
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn only_local_mutations_are_queued() {
        let mut store = test_store();
        let mut emitter = ChangeEmitter::new();
        let (tx, mut rx) = outbox();
        emitter.attach(tx);

        let local = emitter
            .apply(
                &mut store,
                "classes",
                StoreAction::Insert,
                record(json!({"id": "C1"})),
                Origin::Local,
            )
            .unwrap();
        let remote = emitter
            .apply(
                &mut store,
                "classes",
                StoreAction::Update,
                record(json!({"id": "C1", "title": "Art"})),
                Origin::Remote,
            )
            .unwrap();

        assert!(local.delivery.is_some());
        assert!(remote.delivery.is_none());

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.change.kind, ChangeType::Insert);
        assert_eq!(envelope.change.target.id().as_deref(), Some("C1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_store_mutation_notifies_nobody() {
        let mut store = test_store();
        let mut emitter = ChangeEmitter::new();
        let (seen, listener) = recorder();
        emitter.subscribe(Scope::All, listener);
        let (tx, mut rx) = outbox();
        emitter.attach(tx);

        let result = emitter.apply(
            &mut store,
            "classes",
            StoreAction::Update,
            record(json!({"id": "missing"})),
            Origin::Local,
        );
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert!(seen.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_reports_delete() {
        let mut store = test_store();
        let mut emitter = ChangeEmitter::new();
        emitter
            .apply(
                &mut store,
                "classes",
                StoreAction::Insert,
                record(json!({"id": "L1", "title": "Math"})),
                Origin::Local,
            )
            .unwrap();

        let removed = emitter
            .apply(
                &mut store,
                "classes",
                StoreAction::Remove,
                record(json!({"id": "L1"})),
                Origin::Remote,
            )
            .unwrap();
        assert_eq!(removed.kind, ChangeType::Delete);
        assert_eq!(removed.record.get_str("title"), Some("Math"));
        assert!(store.get("classes", "L1").is_none());
    }

    #[tokio::test]
    async fn delivery_dropped_when_pump_gone() {
        let (tx, rx) = outbox();
        drop(rx);
        let delivery = tx.push(OutboundChange::new(
            ChangeType::Insert,
            "classes",
            Record::new().with("id", "C1"),
        ));
        assert!(matches!(delivery.landed().await, Err(Error::DeliveryDropped)));
    }
}
