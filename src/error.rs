//! Error types for compensator-rs.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("executor already registered: {0}")]
    DuplicateExecutor(String),

    #[error("no executor registered for task {0}")]
    ExecutorNotFound(String),

    /// The executor returned an error. Carries its message verbatim.
    #[error("{0}")]
    Handler(String),

    #[error("panic: {0}")]
    Panic(String),

    #[error("timeout {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("execution cancelled")]
    Cancelled,

    #[error("invalid task params: {0}")]
    InvalidParams(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for outcomes of an execution attempt, which are recorded on the
    /// task row instead of aborting the surrounding operation.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Error::Handler(_)
                | Error::Panic(_)
                | Error::Timeout(_)
                | Error::Cancelled
                | Error::ExecutorNotFound(_)
                | Error::InvalidParams(_)
        )
    }

    /// Short label used for the `outcome` metric attribute.
    pub fn outcome(&self) -> &'static str {
        match self {
            Error::Handler(_) | Error::InvalidParams(_) => "error",
            Error::Panic(_) => "panic",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::ExecutorNotFound(_) => "not_found",
            _ => "system",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
