//! Error types for the metadata engine and its operations surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by every engine operation.
///
/// Validation failures (`InvalidRequest`) are raised before any row is
/// touched. The not-found family and `ObjectAlreadyExists` are terminal for
/// the request. `Storage` and `Corrupted` are internal and carry the name of
/// the operation that failed.
#[derive(Debug, Error)]
pub enum MetabaseError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("segment not found: {0}")]
    SegmentNotFound(String),
    #[error("pending object missing: {0}")]
    PendingObjectMissing(String),
    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),
    #[error("{operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("corrupted metadata: {0}")]
    Corrupted(String),
}

pub type MetabaseResult<T> = Result<T, MetabaseError>;

impl MetabaseError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound(_) | Self::SegmentNotFound(_) | Self::PendingObjectMissing(_)
        )
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Corrupted(_))
    }

    /// Log internal failures with enough context to diagnose them offline.
    /// Caller-facing kinds are not logged here.
    pub(crate) fn log_internal(&self, operation: &'static str, stream_id: Option<Uuid>) {
        if self.is_internal() {
            match stream_id {
                Some(stream_id) => tracing::error!(
                    %stream_id,
                    operation,
                    error = %self,
                    "metabase operation failed"
                ),
                None => tracing::error!(operation, error = %self, "metabase operation failed"),
            }
        }
    }
}

/// Attach the failing operation to a raw `sqlx` error.
pub(crate) trait StorageContext<T> {
    fn op(self, operation: &'static str) -> MetabaseResult<T>;
}

impl<T> StorageContext<T> for Result<T, sqlx::Error> {
    fn op(self, operation: &'static str) -> MetabaseResult<T> {
        self.map_err(|source| MetabaseError::Storage { operation, source })
    }
}

/// True when `err` is a UNIQUE or PRIMARY KEY constraint failure.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

/// Failure of an operations endpoint, rendered as a JSON body with the
/// metabase error kind.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, error = %self.message, "operations request failed");
        }
        let body = Json(json!({
            "kind": self.kind,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<MetabaseError> for AppError {
    fn from(err: MetabaseError) -> Self {
        let (status, kind) = match &err {
            MetabaseError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            MetabaseError::ObjectNotFound(_) => (StatusCode::NOT_FOUND, "object_not_found"),
            MetabaseError::SegmentNotFound(_) => (StatusCode::NOT_FOUND, "segment_not_found"),
            MetabaseError::PendingObjectMissing(_) => {
                (StatusCode::NOT_FOUND, "pending_object_missing")
            }
            MetabaseError::ObjectAlreadyExists(_) => (StatusCode::CONFLICT, "object_exists"),
            MetabaseError::Storage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
            MetabaseError::Corrupted(_) => (StatusCode::INTERNAL_SERVER_ERROR, "corrupted"),
        };
        AppError::new(status, kind, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
