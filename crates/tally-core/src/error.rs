//! Error types for tally-core

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Sync endpoint is missing or disabled
    #[error("Sync is not configured")]
    NotConfigured,

    /// Stored credential is encrypted and no unlock session is active
    #[error("Vault is locked; unlock it to use the stored sync credential")]
    Locked,

    /// Destructive operation attempted without an elevated credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Failure reported by the remote service
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local atomic replace could not commit and was rolled back
    #[error("Transaction failed and was rolled back: {0}")]
    Transaction(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Secret vault error
    #[error("Vault error: {0}")]
    Vault(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotConfigured => ErrorCode::NotConfigured,
            Self::Locked => ErrorCode::Locked,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Remote(_) => ErrorCode::RemoteError,
            Self::Transaction(_) => ErrorCode::TransactionFailure,
            Self::LibSql(_) => ErrorCode::LocalStore,
            Self::Io(_) => ErrorCode::Io,
            Self::InvalidInput(_) | Self::Serialization(_) => ErrorCode::InvalidInput,
            Self::Vault(_) => ErrorCode::Vault,
        }
    }
}

/// Failure reported by the remote table, blob or realtime service.
///
/// Keeps the service's own status, code and message so destructive
/// operations stay diagnosable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Operation that failed (e.g. `insert invoice`).
    pub operation: String,
    /// HTTP status, when the failure came from an HTTP response.
    pub status: Option<u16>,
    /// Service-specific error code (e.g. `23505`, `PGRST205`).
    pub code: Option<String>,
    /// Service-provided message, verbatim.
    pub message: String,
}

impl RemoteError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: None,
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether the failure means the target table does not exist remotely.
    pub fn is_missing_table(&self) -> bool {
        matches!(self.code.as_deref(), Some("42P01" | "PGRST205")) || self.status == Some(404)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remote {} failed: {}", self.operation, self.message)?;
        match (&self.code, self.status) {
            (Some(code), Some(status)) => write!(f, " (code {code}, HTTP {status})"),
            (Some(code), None) => write!(f, " (code {code})"),
            (None, Some(status)) => write!(f, " (HTTP {status})"),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Stable error codes exposed across the invocation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotConfigured,
    Locked,
    Unauthorized,
    RemoteError,
    TransactionFailure,
    LocalStore,
    InvalidInput,
    Vault,
    Io,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::NotConfigured => "NOT_CONFIGURED",
            Self::Locked => "LOCKED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RemoteError => "REMOTE_ERROR",
            Self::TransactionFailure => "TRANSACTION_FAILURE",
            Self::LocalStore => "LOCAL_STORE",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Vault => "VAULT",
            Self::Io => "IO",
        };
        f.write_str(code)
    }
}

/// Structured `{code, message}` error returned by the invocation surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl From<Error> for ErrorResponse {
    fn from(error: Error) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display_keeps_service_code_and_message() {
        let error = RemoteError::new("insert invoice", "duplicate key value")
            .with_code("23505")
            .with_status(409);
        assert_eq!(
            error.to_string(),
            "Remote insert invoice failed: duplicate key value (code 23505, HTTP 409)"
        );
    }

    #[test]
    fn missing_table_detection() {
        assert!(RemoteError::new("delete", "x").with_code("PGRST205").is_missing_table());
        assert!(RemoteError::new("delete", "x").with_code("42P01").is_missing_table());
        assert!(RemoteError::new("delete", "x").with_status(404).is_missing_table());
        assert!(!RemoteError::new("delete", "x").with_status(500).is_missing_table());
    }

    #[test]
    fn error_response_serializes_code_and_message() {
        let response = ErrorResponse::from(Error::Locked);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], "LOCKED");
        assert!(json["message"].as_str().unwrap().contains("locked"));
    }

    #[test]
    fn remote_error_maps_to_remote_code() {
        let error: Error = RemoteError::new("select client", "boom").into();
        assert_eq!(error.code(), ErrorCode::RemoteError);
        assert_eq!(ErrorResponse::from(error).code.to_string(), "REMOTE_ERROR");
    }
}
