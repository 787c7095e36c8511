//! Error types for the sync engine core.

use crate::{OpId, PrimaryKey, TableName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors from the deterministic core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid hlc: {0}")]
    InvalidHlc(String),

    // Outbox errors
    #[error("pending op not found: {0}")]
    OpNotFound(OpId),

    #[error("pending op {0} is not in the failed state")]
    OpNotFailed(OpId),

    #[error("record not found: {table}/{key}")]
    RecordNotFound { table: TableName, key: PrimaryKey },

    // Durability errors
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    #[error("store is read-only")]
    ReadOnly,
}

impl Error {
    /// Whether this error means persisted state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CorruptRecord(_) | Error::InvalidSnapshot(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Sync error taxonomy shared by the loops, the ledger and providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_NETWORK")]
    Network,
    #[serde(rename = "ERR_RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "ERR_VALIDATION")]
    Validation,
    #[serde(rename = "ERR_AUTH_EXPIRED")]
    AuthExpired,
    #[serde(rename = "ERR_CURSOR_EXPIRED")]
    CursorExpired,
    #[serde(rename = "ERR_SCHEMA_UNSUPPORTED")]
    SchemaUnsupported,
    /// Unrecoverable local failure (corrupt outbox, invalid snapshot).
    #[serde(rename = "ERR_INTERNAL")]
    Internal,
}

impl ErrorCode {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Network => "ERR_NETWORK",
            ErrorCode::RateLimited => "ERR_RATE_LIMITED",
            ErrorCode::Validation => "ERR_VALIDATION",
            ErrorCode::AuthExpired => "ERR_AUTH_EXPIRED",
            ErrorCode::CursorExpired => "ERR_CURSOR_EXPIRED",
            ErrorCode::SchemaUnsupported => "ERR_SCHEMA_UNSUPPORTED",
            ErrorCode::Internal => "ERR_INTERNAL",
        }
    }

    /// Retried transparently with capped backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorCode::Network | ErrorCode::RateLimited)
    }

    /// Surfaced once and left in the `failed` state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorCode::Validation | ErrorCode::SchemaUnsupported | ErrorCode::Internal
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
