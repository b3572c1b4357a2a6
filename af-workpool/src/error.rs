use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkpoolError>;

#[derive(Error, Debug)]
pub enum WorkpoolError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A released lease is not held by the workpool.
    #[error("Lease {0} is not present in the workpool")]
    LeaseNotPresent(String),

    /// The instancer refused or failed to produce a VM.
    #[error("Instancing failed: {0}")]
    Instancing(String),

    /// A pending acquire was failed because the pool left the available state.
    #[error("Workpool unavailable: {0}")]
    Unavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    /// The actor behind a handle is gone.
    #[error("{0} is no longer running")]
    Stopped(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkpoolError {
    pub fn backend(message: impl std::fmt::Display) -> Self {
        Self::Backend(message.to_string())
    }
}
