use thiserror::Error;

/// Failures of the persistence layer. Callers treat every variant as
/// "storage unavailable": nothing may be assumed durable.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}
