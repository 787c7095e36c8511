//! Error types for the runtime.

use driftsync_engine::ErrorCode;

use crate::config::ConfigError;

/// Error reported by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
    /// Server-specified delay before the next attempt
    pub retry_after_ms: Option<u64>,
    /// Transport status, when the backend speaks HTTP
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_ms: None,
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            retry_after_ms: Some(retry_after_ms),
            status: Some(429),
            ..Self::new(ErrorCode::RateLimited, "rate limit exceeded")
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn auth_expired() -> Self {
        Self::new(ErrorCode::AuthExpired, "credential expired or revoked")
    }

    pub fn cursor_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CursorExpired, message)
    }

    pub fn schema_unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SchemaUnsupported, message)
    }

    /// Classify an HTTP-style status code.
    ///
    /// 5xx and 429 are retriable, 401 pauses for a new credential, 410 means
    /// the cursor is gone, 422 means the backend rejects the schema, and any
    /// other 4xx is terminal.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let code = match status {
            401 | 403 => ErrorCode::AuthExpired,
            410 => ErrorCode::CursorExpired,
            422 => ErrorCode::SchemaUnsupported,
            429 => ErrorCode::RateLimited,
            400..=499 => ErrorCode::Validation,
            500..=599 => ErrorCode::Network,
            _ => ErrorCode::Internal,
        };
        Self {
            status: Some(status),
            ..Self::new(code, message)
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}

/// Errors surfaced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("engine error: {0}")]
    Engine(#[from] driftsync_engine::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no active provider")]
    NoProvider,

    #[error("provider not registered: {0}")]
    UnknownProvider(String),

    #[error("sync paused until a fresh credential is available")]
    AuthBlocked,

    #[error("engine is unhealthy: {0}")]
    Unhealthy(String),

    #[error("request cancelled by a scope switch")]
    Cancelled,

    #[error("engine already started")]
    AlreadyRunning,

    #[error("timed out waiting for in-flight sync work")]
    Timeout,
}

impl SyncError {
    /// Taxonomy code of the error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Provider(e) => e.code,
            SyncError::Engine(e) if e.is_fatal() => ErrorCode::Internal,
            SyncError::Engine(driftsync_engine::Error::ReadOnly) => ErrorCode::SchemaUnsupported,
            SyncError::Engine(_) | SyncError::Config(_) => ErrorCode::Validation,
            SyncError::AuthBlocked => ErrorCode::AuthExpired,
            SyncError::Cancelled | SyncError::Timeout | SyncError::NoProvider => ErrorCode::Network,
            SyncError::UnknownProvider(_)
            | SyncError::Unhealthy(_)
            | SyncError::AlreadyRunning => ErrorCode::Internal,
        }
    }

    /// Whether the error leaves local state untrustworthy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Engine(e) if e.is_fatal())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
