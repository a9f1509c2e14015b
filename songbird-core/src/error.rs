use thiserror::Error;

/// All domain-level errors produced by songbird-core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("clip not found for key {0}")]
    ClipMissing(String),

    #[error("blob store error: {0}")]
    Store(String),

    #[error("repository error: {0}")]
    Repository(#[from] crate::repository::RepoError),

    #[error("inference error: {0}")]
    Inference(#[from] crate::inference::InferenceError),

    #[error("dispatcher queue is full")]
    DispatcherBusy,

    #[error("dispatcher is shutting down")]
    DispatcherShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
