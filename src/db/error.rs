//! Typed failures surfaced by the document store and the stores built on it.

use serde::Serialize;
use thiserror::Error;

/// Why a document could not be returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundReason {
    /// No document with this id was ever written
    Missing,
    /// The document exists only as a tombstone
    Deleted,
}

impl NotFoundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {id} ({reason})")]
    NotFound { id: String, reason: NotFoundReason },

    #[error("Document update conflict: {id}")]
    Conflict { id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database unavailable")]
    Lock,
}

impl StoreError {
    pub fn missing(id: impl Into<String>) -> Self {
        Self::NotFound {
            id: id.into(),
            reason: NotFoundReason::Missing,
        }
    }

    pub fn deleted(id: impl Into<String>) -> Self {
        Self::NotFound {
            id: id.into(),
            reason: NotFoundReason::Deleted,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
