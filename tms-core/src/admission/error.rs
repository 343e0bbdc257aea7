use thiserror::Error;

use crate::catalog::CatalogError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("failed to stop relay for channel {channel}: {reason}")]
    Lifecycle { channel: String, reason: String },
}

pub type AdmissionResult<T> = std::result::Result<T, AdmissionError>;
