// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for soma-core.
//!
//! Every error maps onto one of the result statuses handed back to callers.

use thiserror::Error;

use crate::msg::Status;

/// Result type using SomaError
pub type Result<T> = std::result::Result<T, SomaError>;

/// Errors raised while handling requests and jobs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SomaError {
    /// The request is malformed or conflicts with current state.
    #[error("{0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The requesting user is unknown or inactive.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The requesting user may not perform this request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The target handler or repository cannot take work right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// No handler serves this section/action combination.
    #[error("unknown request: {section} {action}")]
    UnknownRequest {
        /// Request section.
        section: String,
        /// Request action.
        action: String,
    },

    /// Stored or in-memory state violates an invariant.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Stored JSON could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SomaError {
    /// Result status reported to the caller.
    pub fn status(&self) -> Status {
        match self {
            Self::Validation(_) => Status::BadRequest,
            Self::NotFound(_) => Status::NotFound,
            Self::Unauthorized(_) => Status::Unauthorized,
            Self::Forbidden(_) => Status::Forbidden,
            Self::Unavailable(_) => Status::Unavailable,
            Self::UnknownRequest { .. } => Status::UnknownRequest,
            Self::Invariant(_) | Self::Database(_) | Self::Migrate(_) | Self::Json(_) => {
                Status::ServerError
            }
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::UnknownRequest { .. } => "UNKNOWN_REQUEST",
            Self::Invariant(_) => "INVARIANT_VIOLATION",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migrate(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Whether the failure is on our side rather than the caller's.
    pub fn is_server_error(&self) -> bool {
        self.status() == Status::ServerError
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

impl From<soma_tree::TreeError> for SomaError {
    fn from(err: soma_tree::TreeError) -> Self {
        use soma_tree::TreeError;
        match err {
            TreeError::NotFound(object) => Self::NotFound(object.to_string()),
            TreeError::LoadMismatch { .. } | TreeError::ActionOverflow(_) => {
                Self::Invariant(err.to_string())
            }
            other => Self::Validation(other.to_string()),
        }
    }
}
