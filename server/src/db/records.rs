//! Database operations for the records table.
//!
//! Every collection shares one table. The replica-level fields (`id`,
//! timestamps, `revision`) are columns; everything else is the JSONB
//! payload, merged key by key on update.

use chrono::{DateTime, Utc};
use congregate_engine::{
    record::{fields, format_timestamp},
    CollectionDef, Record,
};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};

const COLUMNS: &str =
    "collection, id, payload, revision, created_at, updated_at, deleted_at, unique_key";

/// A stored record row from the database.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub collection: String,
    pub id: String,
    pub payload: Value,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub unique_key: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            collection: row.try_get("collection")?,
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            revision: row.try_get("revision")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
            unique_key: row.try_get("unique_key")?,
        })
    }
}

impl StoredRecord {
    /// Convert the row to the record clients see.
    pub fn to_record(&self, def: &CollectionDef) -> Record {
        let mut record = match &self.payload {
            Value::Object(map) => Record::from(map.clone()),
            _ => Record::new(),
        };
        record.set_id(self.id.clone());
        record.set(fields::CREATED_AT, format_timestamp(self.created_at));
        record.set(fields::UPDATED_AT, format_timestamp(self.updated_at));
        record.set(
            fields::DELETED_AT,
            self.deleted_at
                .map(|ts| Value::String(format_timestamp(ts)))
                .unwrap_or(Value::Null),
        );
        if def.revisioned {
            record.set(fields::REVISION, self.revision);
        }
        record
    }
}

/// Result of a write that upstream may refuse.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The write landed; the row as stored
    Written(StoredRecord),
    /// The unique key is taken. On create, the live row holding it; on
    /// update, the row as stored, unchanged
    UniqueViolation(StoredRecord),
    /// The client's revision is stale; the row as stored
    RevisionMismatch(StoredRecord),
    NotFound,
}

/// Application fields of a record: everything but the columns.
pub fn payload_of(record: &Record) -> Value {
    let payload: Map<String, Value> = record
        .iter()
        .filter(|(field, _)| {
            !matches!(
                field.as_str(),
                fields::ID
                    | fields::CREATED_AT
                    | fields::UPDATED_AT
                    | fields::DELETED_AT
                    | fields::REVISION
            )
        })
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect();
    Value::Object(payload)
}

/// PostgreSQL unique violation code is "23505".
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        db_err.code().map(|c| c == "23505").unwrap_or(false)
    } else {
        false
    }
}

/// Get a record by collection and ID, tombstones included.
pub async fn get_record(
    pool: &PgPool,
    collection: &str,
    id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records WHERE collection = $1 AND id = $2"
    ))
    .bind(collection)
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// The live row holding a unique key.
pub async fn find_by_unique_key(
    pool: &PgPool,
    collection: &str,
    unique_key: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records
         WHERE collection = $1 AND unique_key = $2 AND deleted_at IS NULL"
    ))
    .bind(collection)
    .bind(unique_key)
    .fetch_optional(pool)
    .await
}

/// Records of one collection in creation order.
pub async fn list_records(
    pool: &PgPool,
    collection: &str,
    include_deleted: bool,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records
         WHERE collection = $1 AND ($2 OR deleted_at IS NULL)
         ORDER BY created_at, id"
    ))
    .bind(collection)
    .bind(include_deleted)
    .fetch_all(pool)
    .await
}

/// Every record of every collection, tombstones included.
pub async fn all_records(pool: &PgPool) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records ORDER BY collection, created_at, id"
    ))
    .fetch_all(pool)
    .await
}

/// Insert a record.
///
/// Creating an id that already exists returns the stored row unchanged, so
/// a redelivered create is harmless.
pub async fn create_record(
    pool: &PgPool,
    def: &CollectionDef,
    id: &str,
    target: &Record,
) -> Result<WriteOutcome, sqlx::Error> {
    let unique_key = def.unique_key(target);
    let inserted = sqlx::query_as::<_, StoredRecord>(&format!(
        "INSERT INTO records (collection, id, payload, unique_key)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (collection, id) DO NOTHING
         RETURNING {COLUMNS}"
    ))
    .bind(&def.name)
    .bind(id)
    .bind(payload_of(target))
    .bind(&unique_key)
    .fetch_optional(pool)
    .await;

    match inserted {
        Ok(Some(row)) => Ok(WriteOutcome::Written(row)),
        Ok(None) => Ok(get_record(pool, &def.name, id)
            .await?
            .map_or(WriteOutcome::NotFound, WriteOutcome::Written)),
        Err(e) if is_unique_violation(&e) => unique_conflict(pool, def, unique_key, e).await,
        Err(e) => Err(e),
    }
}

/// Merge a record's fields into the stored row and bump its revision.
///
/// On revisioned collections a target carrying a `revision` must match the
/// stored one. Updating a tombstone revives it.
pub async fn update_record(
    pool: &PgPool,
    def: &CollectionDef,
    id: &str,
    target: &Record,
) -> Result<WriteOutcome, sqlx::Error> {
    let Some(existing) = get_record(pool, &def.name, id).await? else {
        return Ok(WriteOutcome::NotFound);
    };

    let expected = target.revision().filter(|_| def.revisioned);
    let payload = merged_payload(&existing.payload, target);
    let unique_key = def
        .unique_key(&Record::from_value(payload.clone()).unwrap_or_default())
        .or(existing.unique_key.clone());

    let updated = sqlx::query_as::<_, StoredRecord>(&format!(
        "UPDATE records
         SET payload = $3, unique_key = $4, revision = revision + 1,
             updated_at = now(), deleted_at = NULL
         WHERE collection = $1 AND id = $2 AND ($5::BIGINT IS NULL OR revision = $5)
         RETURNING {COLUMNS}"
    ))
    .bind(&def.name)
    .bind(id)
    .bind(payload)
    .bind(&unique_key)
    .bind(expected.map(|r| r as i64))
    .fetch_optional(pool)
    .await;

    match updated {
        Ok(Some(row)) => Ok(WriteOutcome::Written(row)),
        Ok(None) => Ok(get_record(pool, &def.name, id)
            .await?
            .map_or(WriteOutcome::NotFound, WriteOutcome::RevisionMismatch)),
        Err(e) if is_unique_violation(&e) => Ok(WriteOutcome::UniqueViolation(existing)),
        Err(e) => Err(e),
    }
}

/// Soft-delete a record. An existing `deleted_at` is kept.
pub async fn delete_record(
    pool: &PgPool,
    collection: &str,
    id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "UPDATE records
         SET deleted_at = COALESCE(deleted_at, now()), updated_at = now(),
             revision = revision + 1
         WHERE collection = $1 AND id = $2
         RETURNING {COLUMNS}"
    ))
    .bind(collection)
    .bind(id)
    .fetch_optional(pool)
    .await
}

async fn unique_conflict(
    pool: &PgPool,
    def: &CollectionDef,
    unique_key: Option<String>,
    error: sqlx::Error,
) -> Result<WriteOutcome, sqlx::Error> {
    let Some(key) = unique_key else {
        return Err(error);
    };
    match find_by_unique_key(pool, &def.name, &key).await? {
        Some(row) => Ok(WriteOutcome::UniqueViolation(row)),
        // the holder was deleted in between
        None => Err(error),
    }
}

fn merged_payload(stored: &Value, target: &Record) -> Value {
    let mut merged = match stored {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(changes) = payload_of(target) {
        merged.extend(changes);
    }
    Value::Object(merged)
}
