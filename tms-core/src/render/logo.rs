use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use image::RgbaImage;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use super::error::{RenderError, RenderResult};

pub const LOGO_TTL: Duration = Duration::from_secs(60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Channel logos fetched over HTTP and kept on disk for [`LOGO_TTL`].
pub struct LogoCache {
    dir: PathBuf,
    client: Client,
    ttl: Duration,
}

impl fmt::Debug for LogoCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogoCache")
            .field("dir", &self.dir)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl LogoCache {
    pub fn new(dir: impl Into<PathBuf>) -> RenderResult<Self> {
        let client = Client::builder()
            .user_agent("TooManyStreams/1.0")
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            dir: dir.into(),
            client,
            ttl: LOGO_TTL,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.dir.join(hex::encode(Sha256::digest(url.as_bytes())))
    }

    /// Missing, unreachable or undecodable logos come back as `None`.
    pub async fn get(&self, url: &str) -> Option<RgbaImage> {
        if url.is_empty() {
            return None;
        }
        match self.load(url).await {
            Ok(image) => Some(image),
            Err(err) => {
                debug!(url, error = %err, "logo unavailable");
                None
            }
        }
    }

    async fn load(&self, url: &str) -> RenderResult<RgbaImage> {
        let path = self.cache_path(url);
        if self.is_fresh(&path).await {
            let bytes = fs::read(&path).await.map_err(|source| RenderError::Io {
                path: path.clone(),
                source,
            })?;
            return Ok(image::load_from_memory(&bytes)?.to_rgba8());
        }

        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let decoded = image::load_from_memory(&bytes)?.to_rgba8();
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| RenderError::Io {
                path: self.dir.clone(),
                source,
            })?;
        fs::write(&path, &bytes)
            .await
            .map_err(|source| RenderError::Io { path, source })?;
        Ok(decoded)
    }

    async fn is_fresh(&self, path: &Path) -> bool {
        let Ok(metadata) = fs::metadata(path).await else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age < self.ttl)
            .unwrap_or(false)
    }
}
