//! Error types for the congregate engine.

use crate::{CollectionName, RecordId};
use thiserror::Error;

/// All possible errors from the congregate engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Store contract violations
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("record already exists in {collection}: {id}")]
    DuplicateId {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("record not found in {collection}: {id}")]
    NotFound {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("record in {0} has no id")]
    MissingId(CollectionName),

    // Replication errors
    #[error("malformed change message: {0}")]
    MalformedMessage(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("delivery dropped before acknowledgment")]
    DeliveryDropped,
}

impl Error {
    pub(crate) fn duplicate(collection: &str, id: &str) -> Self {
        Error::DuplicateId {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Error::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::CollectionNotFound("students".into());
        assert_eq!(err.to_string(), "collection not found: students");

        let err = Error::duplicate("divisionClasses", "dc-1");
        assert_eq!(
            err.to_string(),
            "record already exists in divisionClasses: dc-1"
        );

        let err = Error::not_found("people", "p-9");
        assert_eq!(err.to_string(), "record not found in people: p-9");

        let err = Error::MalformedMessage("missing collection".into());
        assert_eq!(
            err.to_string(),
            "malformed change message: missing collection"
        );
    }
}
