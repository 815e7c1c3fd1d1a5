//! Change handler - persists changes emitted by clients.
//!
//! Every write path (WebSocket `emit` and the HTTP collection routes) goes
//! through [`apply_change`], which answers with the acknowledgment the
//! client's reconciler expects.

use congregate_engine::{
    ChangeMessage, ChangeType, CollectionDef, ErrorInfo, OutboundChange, Record, Schema,
};
use sqlx::PgPool;

use crate::db::{self, StoredRecord, WriteOutcome};
use crate::error::{AppError, Result};

/// Error name sent when a revisioned update is stale.
pub const REVISION_MISMATCH: &str = "RevisionMismatchError";

/// Error name sent when an update would take a unique key another live
/// record holds. The updated record stays live as stored.
pub const UNIQUE_UPDATE_REJECTED: &str = "UniqueUpdateRejectedError";

/// Persist one change and build its acknowledgment.
///
/// Refused writes are not errors: the acknowledgment carries the canonical
/// row together with an [`ErrorInfo`]. Only a missing target, an unknown
/// collection, or a database failure return `Err`.
pub async fn apply_change(
    pool: &PgPool,
    schema: &Schema,
    change: OutboundChange,
) -> Result<ChangeMessage> {
    let def = schema
        .get(&change.collection)
        .ok_or_else(|| AppError::NotFound(format!("collection {}", change.collection)))?;

    let ack = match change.kind {
        ChangeType::Insert => insert(pool, def, change.target).await?,
        ChangeType::Update => update(pool, def, change.target).await?,
        ChangeType::Delete => delete(pool, def, change.target).await?,
    };

    match &ack.error {
        Some(error) => tracing::debug!(
            collection = %def.name,
            error = %error.name,
            "Change refused"
        ),
        None => {
            let id = ack.record.id().unwrap_or_default();
            tracing::debug!(
                collection = %def.name,
                kind = ack.kind.as_str(),
                id = %id,
                "Change persisted"
            )
        }
    }

    Ok(ack)
}

async fn insert(pool: &PgPool, def: &CollectionDef, target: Record) -> Result<ChangeMessage> {
    let id = target
        .id()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let ack = match db::create_record(pool, def, &id, &target).await? {
        WriteOutcome::Written(row) => message(ChangeType::Insert, def, &row),
        WriteOutcome::UniqueViolation(row) => message(ChangeType::Insert, def, &row)
            .with_error(ErrorInfo::unique_violation(unique_detail(def))),
        WriteOutcome::RevisionMismatch(_) | WriteOutcome::NotFound => {
            return Err(AppError::Internal(format!(
                "create of {}/{} returned no row",
                def.name, id
            )))
        }
    };
    Ok(ack.with_prior(target))
}

async fn update(pool: &PgPool, def: &CollectionDef, target: Record) -> Result<ChangeMessage> {
    let id = required_id(def, &target)?;

    let ack = match db::update_record(pool, def, &id, &target).await? {
        WriteOutcome::Written(row) => message(ChangeType::Update, def, &row),
        WriteOutcome::UniqueViolation(row) => message(ChangeType::Update, def, &row)
            .with_error(ErrorInfo::new(UNIQUE_UPDATE_REJECTED, Some(unique_detail(def)))),
        WriteOutcome::RevisionMismatch(row) => {
            message(ChangeType::Update, def, &row).with_error(ErrorInfo::new(
                REVISION_MISMATCH,
                Some(format!("{}/{} is at revision {}", def.name, id, row.revision)),
            ))
        }
        WriteOutcome::NotFound => return Err(not_found(def, &id)),
    };
    Ok(ack.with_prior(target))
}

async fn delete(pool: &PgPool, def: &CollectionDef, target: Record) -> Result<ChangeMessage> {
    let id = required_id(def, &target)?;
    match db::delete_record(pool, &def.name, &id).await? {
        Some(row) => Ok(message(ChangeType::Delete, def, &row)),
        None => Err(not_found(def, &id)),
    }
}

fn message(kind: ChangeType, def: &CollectionDef, row: &StoredRecord) -> ChangeMessage {
    ChangeMessage::new(kind, def.name.clone(), row.to_record(def))
}

fn required_id(def: &CollectionDef, target: &Record) -> Result<String> {
    target
        .id()
        .ok_or_else(|| congregate_engine::Error::MissingId(def.name.clone()).into())
}

fn not_found(def: &CollectionDef, id: &str) -> AppError {
    congregate_engine::Error::NotFound {
        collection: def.name.clone(),
        id: id.to_string(),
    }
    .into()
}

fn unique_detail(def: &CollectionDef) -> String {
    format!("{} must be unique in {}", def.unique.join("+"), def.name)
}
