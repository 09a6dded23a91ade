use thiserror::Error;

use crate::auth::initdata::InitDataError;
use crate::auth::pin::PinError;

/// Centralized error types for the application
///
/// All errors in the application are converted to this enum for consistent error handling.
/// Uses `thiserror` for automatic error conversion and display formatting.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// Init data verification failures
    #[error("Init data error: {0}")]
    InitData(#[from] InitDataError),

    /// PIN guard failures (format, lockout, mismatch)
    #[error("PIN error: {0}")]
    Pin(#[from] PinError),

    /// No wallet account for the given Telegram user id
    #[error("Account {0} not found")]
    AccountNotFound(i64),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Anyhow errors (for general error handling)
    #[error("Application error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;
