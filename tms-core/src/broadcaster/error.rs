use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::render::RenderError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        #[source]
        source: std::io::Error,
        addr: String,
    },
    #[error("failed to spawn encoder {program}: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: PathBuf,
    },
    #[error("encoder started without an output pipe")]
    MissingOutput,
    #[error("http server failed on {addr}: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
        addr: SocketAddr,
    },
    #[error("render error: {0}")]
    Render(#[from] RenderError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;
