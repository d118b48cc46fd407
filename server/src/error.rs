use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures coming out of a `Repository`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    /// Transient; the operation may be retried.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Constraint(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Corrupt(err.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    IllegalTransition,
    StaleVersion,
    TicketClosed,
    ConversationClosed,
}

impl ConflictReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IllegalTransition => "illegal_transition",
            Self::StaleVersion => "stale_version",
            Self::TicketClosed => "ticket_closed",
            Self::ConversationClosed => "conversation_closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("{message}")]
    Conflict {
        reason: ConflictReason,
        message: String,
    },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Authorization(String),
    #[error("missing or malformed identity claims")]
    Unauthenticated,
    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl CoreError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(reason: ConflictReason, message: impl Into<String>) -> Self {
        Self::Conflict {
            reason,
            message: message.into(),
        }
    }

    /// Maps a store failure, naming the entity for `NotFound`.
    pub fn from_store(entity: &'static str) -> impl Fn(StoreError) -> CoreError {
        move |err| match err {
            StoreError::NotFound => CoreError::NotFound(entity),
            other => CoreError::Storage(other),
        }
    }

    /// Machine-readable reason clients switch on.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code,
            Self::Conflict { reason, .. } => reason.code(),
            Self::NotFound(_) => "not_found",
            Self::Authorization(_) => "forbidden",
            Self::Unauthenticated => "unauthenticated",
            Self::Storage(StoreError::Unavailable(_)) => "storage_unavailable",
            Self::Storage(_) => "storage_failure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Storage(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { reason, .. } => *reason == ConflictReason::StaleVersion,
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err)
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(reason = self.reason(), error = %self, "request failed");
        }
        (
            status,
            Json(json!({
                "error": self.to_string(),
                "reason": self.reason(),
                "retryable": self.is_retryable(),
            })),
        )
            .into_response()
    }
}
