//! # Congregate Engine
//!
//! A synchronized in-memory replica of upstream collections.
//!
//! This crate mirrors server collections locally, accepts optimistic local
//! writes, and reconciles the change notifications upstream sends back,
//! including unique-constraint collisions between two writers. Reads never
//! wait on the network.
//!
//! ## Design Principles
//!
//! - **Optimistic**: local writes land in memory before upstream sees them
//! - **Merge, don't replace**: inbound changes overwrite only the fields they carry
//! - **Soft deletes**: records are tombstoned with `deletedAt`, never dropped,
//!   except when upstream re-keys an optimistic insert
//! - **No echo**: changes received from upstream are never sent back
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a plain JSON object. The replica cares about `id`,
//! `createdAt`, `updatedAt`, `deletedAt` and, on revisioned collections,
//! `revision`. Everything else is application data.
//!
//! ### Store and emitter
//!
//! The [`RecordStore`] keeps one indexed [`Collection`] per entity type. The
//! [`ChangeEmitter`] is the only thing that mutates it: it notifies
//! listeners and, for local changes, queues an [`OutboundChange`] in the
//! [`Outbox`].
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] applies inbound [`ChangeMessage`]s:
//! - unique-constraint errors tombstone our copy and converge on upstream's
//! - insert acknowledgments under a new id move the optimistic record
//! - everything else merges by id
//!
//! ## Quick Start
//!
//! ```rust
//! use congregate_engine::{CollectionDef, Query, Record, Schema, SyncDb};
//! use serde_json::json;
//!
//! // 1. Describe the collections
//! let schema = Schema::new()
//!     .with_collection(CollectionDef::new("students").indexed(["peopleId", "deletedAt"]));
//!
//! // 2. Create the replica
//! let mut db = SyncDb::new(schema);
//!
//! // 3. Write locally
//! let created = db
//!     .create("students", Record::new().with("peopleId", "P1").with("active", true))
//!     .unwrap();
//! let id = created.record.id().unwrap();
//!
//! db.update_fields("students", &id, Record::new().with("active", false))
//!     .unwrap();
//!
//! // 4. Apply an upstream broadcast
//! db.receive(json!({
//!     "type": "insert",
//!     "collection": "students",
//!     "record": {"id": "S2", "peopleId": "P2"}
//! }));
//!
//! // 5. Query
//! let students = db.all("students").unwrap();
//! assert_eq!(students.len(), 2);
//! let p1 = db.current("students", Query::new().eq("peopleId", "P1")).unwrap();
//! assert_eq!(p1[0].get("active"), Some(&json!(false)));
//! ```
//!
//! ## Upstream
//!
//! Attach an [`Outbox`] with [`SyncDb::attach`] and run [`channel::forward`]
//! over a [`Channel`] implementation. Acknowledgments come back on a queue
//! that [`SyncDb::drain`] applies.
//!
//! ## Persistence
//!
//! Nothing is stored locally. Seed with [`SyncDb::load`] from a
//! [`Snapshot`] fetched at session start.

pub mod channel;
pub mod db;
pub mod emitter;
pub mod error;
pub mod message;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod views;

// Re-export main types at crate root
pub use channel::Channel;
pub use db::{MutateOptions, SyncDb};
pub use emitter::{
    outbox, ChangeEmitter, ChangeEvent, Delivery, Mutation, Outbox, Scope, StoreAction,
    SubscriptionId,
};
pub use error::Error;
pub use message::{ChangeMessage, ChangeType, ErrorInfo, OutboundChange};
pub use query::{Clause, Query};
pub use reconcile::{ReconcileOutcome, ReconcileReport, Reconciler};
pub use record::{Origin, Record};
pub use schema::{CollectionDef, Schema};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Collection, RecordStore};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
