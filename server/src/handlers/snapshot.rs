//! Snapshot handler - the full state a client loads at session start.

use congregate_engine::{Schema, Snapshot};
use sqlx::PgPool;

use crate::db::{self, StoredRecord};
use crate::error::Result;

/// Build a snapshot of every collection, tombstones included.
///
/// Collections the schema declares are present even when empty.
pub async fn build_snapshot(pool: &PgPool, schema: &Schema) -> Result<Snapshot> {
    let rows = db::all_records(pool).await?;
    let snapshot = assemble(schema, rows);

    tracing::debug!(
        collections = snapshot.collections.len(),
        records = snapshot.record_count(),
        "Built snapshot"
    );

    Ok(snapshot)
}

fn assemble(schema: &Schema, rows: Vec<StoredRecord>) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for name in schema.collections.keys() {
        snapshot.add_collection(name.clone());
    }
    for row in rows {
        let def = schema.def_or_default(&row.collection);
        snapshot.add_record(row.collection.clone(), row.to_record(&def));
    }
    snapshot
}
