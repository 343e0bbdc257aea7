use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("catalog path not configured")]
    MissingStore,
    #[error("channel {channel_id} not found")]
    ChannelNotFound { channel_id: i64 },
    #[error("catalog task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
