use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::{self, Catalog, NewSource, Source};

use super::error::AdmissionResult;
use super::lifecycle::ChannelLifecycle;

pub const FALLBACK_SOURCE_NAME: &str = "TooManyStreams";
/// Position the fallback takes in a channel's source list, after any real
/// source.
pub const FALLBACK_POSITION: i64 = 9999;

pub fn fallback_url(addr: SocketAddr) -> String {
    format!("http://{addr}/stream.ts")
}

/// The synthetic source that points viewers at the broadcast server.
pub struct FallbackSource {
    catalog: Arc<dyn Catalog>,
    lifecycle: Arc<dyn ChannelLifecycle>,
    url: String,
    /// Resolved once; the lock also serializes creation so concurrent
    /// attaches share one source.
    resolved: Mutex<Option<Source>>,
}

impl fmt::Debug for FallbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackSource")
            .field("url", &self.url)
            .finish()
    }
}

impl FallbackSource {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        lifecycle: Arc<dyn ChannelLifecycle>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            lifecycle,
            url: url.into(),
            resolved: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn find(&self) -> AdmissionResult<Option<Source>> {
        if let Some(source) = self.resolved.lock().await.as_ref() {
            return Ok(Some(source.clone()));
        }
        let url = self.url.clone();
        Ok(catalog::blocking(&self.catalog, move |catalog| {
            catalog.find_source(FALLBACK_SOURCE_NAME, &url)
        })
        .await?)
    }

    pub async fn get_or_create(&self) -> AdmissionResult<Source> {
        let mut resolved = self.resolved.lock().await;
        if let Some(source) = resolved.as_ref() {
            return Ok(source.clone());
        }
        let url = self.url.clone();
        let (source, created) = catalog::blocking(&self.catalog, move |catalog| {
            if let Some(source) = catalog.find_source(FALLBACK_SOURCE_NAME, &url)? {
                return Ok((source, false));
            }
            let source = catalog.create_source(&NewSource {
                name: FALLBACK_SOURCE_NAME.to_string(),
                url,
                account_id: None,
                is_custom: true,
            })?;
            Ok((source, true))
        })
        .await?;
        if created {
            info!(source_id = source.id, url = %self.url, "created fallback source");
        }
        *resolved = Some(source.clone());
        Ok(source)
    }

    /// Returns `true` when the channel did not carry the fallback before.
    pub async fn attach(&self, channel_id: i64) -> AdmissionResult<bool> {
        let source = self.get_or_create().await?;
        let source_id = source.id;
        let attached = catalog::blocking(&self.catalog, move |catalog| {
            catalog.attach_source(channel_id, source_id, FALLBACK_POSITION)
        })
        .await?;
        if attached {
            info!(channel_id, source_id, "attached fallback source");
        }
        Ok(attached)
    }

    /// Detaches the fallback and, when it was attached, stops the channel's
    /// relay so the next viewer starts from a real source.
    pub async fn detach(&self, channel_id: i64) -> AdmissionResult<bool> {
        let source = self.get_or_create().await?;
        let source_id = source.id;
        let channel = catalog::blocking(&self.catalog, move |catalog| {
            if !catalog.detach_source(channel_id, source_id)? {
                return Ok(None);
            }
            catalog.channel(channel_id).map(Some)
        })
        .await?;
        let Some(channel) = channel else {
            debug!(channel_id, "fallback source was not attached");
            return Ok(false);
        };
        info!(channel_id, source_id, "detached fallback source");
        if let Some(channel) = channel {
            self.lifecycle.stop_channel(channel.uuid).await?;
        }
        Ok(true)
    }
}

