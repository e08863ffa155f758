//! Error handling module
//!
//! `MigrationError` is what migration steps fail with; `AppError` is what
//! the admin API answers with.

use crate::db::DbError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Failure of a migration operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// SQLSTATE class 23; the step was rolled back
    #[error("Constraint violation while running `{statement}`: {reason}")]
    ConstraintViolation { statement: String, reason: String },

    #[error("Statement `{statement}` failed: {reason}")]
    Statement { statement: String, reason: String },

    #[error("{0} does not exist")]
    SourceMissing(String),

    #[error("No backup table found for `{0}`")]
    BackupMissing(String),

    #[error("Backup `{backup}` holds {backup_rows} rows but `{table}` holds {table_rows}")]
    BackupIncomplete {
        table: String,
        backup: String,
        table_rows: i64,
        backup_rows: i64,
    },

    /// The live table is gone and the backup could not be put back.
    #[error(
        "Table `{table}` was DROPPED but NOT restored from `{backup}`: {reason}. \
         Recreate it manually from `{backup}` before doing anything else"
    )]
    PostDropIrrecoverable {
        table: String,
        backup: String,
        reason: String,
    },

    #[error("Constraint checking could not be re-enabled: {0}")]
    ConstraintRestore(String),

    #[error("Invalid identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("Unknown migration step `{0}`")]
    UnknownStep(String),
}

impl From<DbError> for MigrationError {
    fn from(e: DbError) -> Self {
        if e.is_constraint_violation() {
            MigrationError::ConstraintViolation {
                statement: e.statement,
                reason: e.reason,
            }
        } else {
            MigrationError::Statement {
                statement: e.statement,
                reason: e.reason,
            }
        }
    }
}

impl MigrationError {
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, MigrationError::PostDropIrrecoverable { .. })
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<String>) {
        match self {
            AppError::Database(e) => {
                error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Migration(e) => match e {
                MigrationError::PostDropIrrecoverable { .. } => {
                    error!("{}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "TABLE_DROPPED_NOT_RESTORED",
                        e.to_string(),
                        None,
                    )
                }
                MigrationError::SourceMissing(_)
                | MigrationError::BackupMissing(_)
                | MigrationError::UnknownStep(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string(), None)
                }
                MigrationError::InvalidIdentifier(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string(), None)
                }
                MigrationError::ConstraintViolation { .. } => (
                    StatusCode::CONFLICT,
                    "CONSTRAINT_VIOLATION",
                    "A constraint violation rolled the step back".to_string(),
                    Some(e.to_string()),
                ),
                _ => {
                    error!("Migration error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "MIGRATION_FAILED",
                        "The migration step failed".to_string(),
                        Some(e.to_string()),
                    )
                }
            },
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                msg.clone(),
                None,
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone(), None),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = self.parts();

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}
