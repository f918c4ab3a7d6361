//! Error taxonomy for the live engine.
//!
//! Remote Store implementations report [`StoreError`]; components wrap it
//! in a [`LiveError`] that says *which* kind of operation failed:
//!
//! | Variant            | Raised when                                        | Local effect                       |
//! |--------------------|----------------------------------------------------|------------------------------------|
//! | `Fetch`            | a bulk load could not complete                     | error flag + empty cache           |
//! | `Write`            | a write-through mutation failed                    | optimistic change rolled back      |
//! | `Subscription`     | a change channel could not be opened or dropped    | stale flag, coordinator retries    |
//! | `OrderViolation`   | a caller asked for a backward status transition    | rejected, nothing applied          |
//!
//! Nothing here is fatal to the host process.

use thiserror::Error;
use uuid::Uuid;

use crate::store::Table;

/// Transport-level failure reported by a Remote Store or blob store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("row not found")]
    NotFound,
    #[error("conflicting row: {0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("change channel closed")]
    Closed,
}

/// Errors surfaced by engine components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
    #[error("failed to fetch {table}: {source}")]
    Fetch { table: Table, source: StoreError },

    #[error("failed to write {table}: {source}")]
    Write { table: Table, source: StoreError },

    #[error("change subscription on {table} failed: {source}")]
    Subscription { table: Table, source: StoreError },

    #[error("{entity} cannot move from {from} to {to}")]
    OrderViolation {
        entity: Uuid,
        from: String,
        to: String,
    },

    #[error("failed to upload {path}: {source}")]
    Upload { path: String, source: StoreError },

    /// Upload succeeded, the metadata insert failed, and removing the blob
    /// failed as well. The blob at `url` has no registry row.
    #[error("blob {url} is orphaned: {source}")]
    OrphanedBlob { url: String, source: StoreError },

    #[error("no authenticated actor")]
    NotAuthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type LiveResult<T> = Result<T, LiveError>;

impl LiveError {
    /// Adapter for `map_err` on bulk loads.
    pub fn fetch(table: Table) -> impl FnOnce(StoreError) -> LiveError {
        move |source| LiveError::Fetch { table, source }
    }

    /// Adapter for `map_err` on write-through calls.
    pub fn write(table: Table) -> impl FnOnce(StoreError) -> LiveError {
        move |source| LiveError::Write { table, source }
    }

    pub fn is_write_failure(&self) -> bool {
        matches!(self, LiveError::Write { .. } | LiveError::OrphanedBlob { .. })
    }

    pub fn is_order_violation(&self) -> bool {
        matches!(self, LiveError::OrderViolation { .. })
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidRecord(value.to_string())
    }
}
