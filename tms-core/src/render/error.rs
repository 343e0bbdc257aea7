use std::path::PathBuf;

use image::ImageError;
use thiserror::Error;

use crate::error::ConfigError;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("io error at {path}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("logo fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to replace {path}: {source}")]
    Persist {
        #[source]
        source: tempfile::PersistError,
        path: PathBuf,
    },
    #[error("settings error: {0}")]
    Settings(#[from] ConfigError),
    #[error("render task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;
