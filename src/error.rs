use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("leader election ({0}) not found")]
    NotFound(String),

    #[error("leader election ({0}) not started")]
    NotStarted(String),

    #[error("invalid election config: {0}")]
    InvalidConfig(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error("blocking store task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

pub type Result<T, E = ElectionError> = std::result::Result<T, E>;
