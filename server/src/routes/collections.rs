//! Collection endpoints.
//!
//! The HTTP face of the persistence API. Mutations go through the same
//! change handler as WebSocket `emit`, so every connected client hears
//! about them.

use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use congregate_engine::{ChangeMessage, ChangeType, OutboundChange, Record, Snapshot};
use serde::Deserialize;

use crate::db;
use crate::error::{AppError, Result};
use crate::handlers::{apply_change, build_snapshot};
use crate::websocket::ServerMessage;
use crate::AppState;

/// Query parameters for listing a collection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Include soft-deleted records
    #[serde(default)]
    pub include_deleted: bool,
}

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/snapshot", get(snapshot_handler))
        .route(
            "/collections/{name}",
            get(list_handler).post(create_handler),
        )
        .route(
            "/collections/{name}/{id}",
            put(update_handler).delete(delete_handler),
        )
}

/// GET /snapshot - Every collection, tombstones included.
async fn snapshot_handler(State(state): State<AppState>) -> Result<Json<Snapshot>> {
    let snapshot = build_snapshot(&state.pool, &state.schema).await?;
    Ok(Json(snapshot))
}

/// GET /collections/{name} - Records of one collection.
async fn list_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Record>>> {
    let def = state
        .schema
        .get(&name)
        .ok_or_else(|| AppError::NotFound(format!("collection {}", name)))?;

    let records = db::list_records(&state.pool, &name, query.include_deleted)
        .await?
        .iter()
        .map(|row| row.to_record(def))
        .collect();
    Ok(Json(records))
}

/// POST /collections/{name} - Create a record.
async fn create_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(target): Json<Record>,
) -> Result<Json<Record>> {
    let change = OutboundChange::new(ChangeType::Insert, name, target);
    mutate(&state, change).await
}

/// PUT /collections/{name}/{id} - Merge fields into a record.
async fn update_handler(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Json(mut target): Json<Record>,
) -> Result<Json<Record>> {
    target.set_id(id);
    let change = OutboundChange::new(ChangeType::Update, name, target);
    mutate(&state, change).await
}

/// DELETE /collections/{name}/{id} - Soft-delete a record.
async fn delete_handler(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<Record>> {
    let target = Record::new().with("id", id);
    let change = OutboundChange::new(ChangeType::Delete, name, target);
    mutate(&state, change).await
}

async fn mutate(state: &AppState, change: OutboundChange) -> Result<Json<Record>> {
    let ack = apply_change(&state.pool, &state.schema, change).await?;
    let ack = refused(ack)?;

    let sent = state.conn_manager.broadcast_all(ServerMessage::changes(ack.clone()));
    tracing::debug!(
        sent_to = sent,
        collection = %ack.collection,
        "Broadcast change to connected clients"
    );

    Ok(Json(ack.record))
}

/// A refused write becomes a 409 over HTTP.
fn refused(ack: ChangeMessage) -> Result<ChangeMessage> {
    match ack.error {
        Some(error) => Err(AppError::Conflict(
            error.message.unwrap_or(error.name),
        )),
        None => Ok(ack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use congregate_engine::ErrorInfo;

    #[test]
    fn refused_write_is_conflict() {
        let ack = ChangeMessage::new(ChangeType::Insert, "students", Record::new().with("id", "S1"))
            .with_error(ErrorInfo::unique_violation("peopleId must be unique in students"));
        match refused(ack) {
            Err(AppError::Conflict(msg)) => {
                assert_eq!(msg, "peopleId must be unique in students")
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let ok = ChangeMessage::new(ChangeType::Delete, "students", Record::new().with("id", "S1"));
        assert!(refused(ok).is_ok());
    }

    #[test]
    fn list_query_defaults() {
        let query: ListQuery = serde_json::from_str("{}").unwrap();
        assert!(!query.include_deleted);
    }
}
