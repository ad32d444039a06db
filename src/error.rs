use thiserror::Error;

/// Engine error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access forbidden")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

/// Coarse classification used by callers that map errors onto their own transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidOperation,
    ValidationFailed,
    Unauthorized,
    Forbidden,
    Cancelled,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Unauthorized => ErrorKind::Unauthorized,
            AppError::Forbidden => ErrorKind::Forbidden,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            AppError::Validation(_) => ErrorKind::ValidationFailed,
            AppError::Cancelled | AppError::DeadlineExceeded => ErrorKind::Cancelled,
            AppError::Internal(_)
            | AppError::Database(_)
            | AppError::Json(_)
            | AppError::Cache(_)
            | AppError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show to the end user.
    ///
    /// Authorization failures never say which permission was missing and
    /// store failures are logged instead of echoed.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Unauthorized => "Unauthorized".to_string(),
            AppError::Forbidden => "Forbidden".to_string(),
            AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::InvalidOperation(msg)
            | AppError::Validation(msg) => msg.clone(),
            AppError::Cancelled => "Request cancelled".to_string(),
            AppError::DeadlineExceeded => "Request timed out".to_string(),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal Server Error".to_string()
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {}", err);
                "Internal Server Error".to_string()
            }
            AppError::Json(err) => {
                tracing::error!("JSON error: {}", err);
                "Internal Server Error".to_string()
            }
            AppError::Cache(msg) => {
                tracing::error!("Cache error: {}", msg);
                "Internal Server Error".to_string()
            }
            AppError::Config(msg) => {
                tracing::error!("Config error: {}", msg);
                "Internal Server Error".to_string()
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /// Wrap a store failure with the operation it interrupted.
    pub fn context(self, op: &str) -> Self {
        match self {
            AppError::Database(err) => AppError::Internal(format!("{}: {}", op, err)),
            AppError::Cache(msg) => AppError::Cache(format!("{}: {}", op, msg)),
            other => other,
        }
    }
}

/// Result type alias for the engine
pub type AppResult<T> = Result<T, AppError>;

/// Helper trait for converting Option to AppError::NotFound
pub trait OptionExt<T> {
    fn ok_or_not_found(self, msg: impl Into<String>) -> AppResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, msg: impl Into<String>) -> AppResult<T> {
        self.ok_or_else(|| AppError::NotFound(msg.into()))
    }
}

/// Optional lookups treat "not found" as an empty result.
pub trait OptionalExt<T> {
    fn optional(self) -> AppResult<Option<T>>;
}

impl<T> OptionalExt<T> for AppResult<T> {
    fn optional(self) -> AppResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache(err.to_string())
    }
}
