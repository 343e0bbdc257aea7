use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{self, Catalog, CatalogError};
use crate::store::{keys, StateStore, StoreError};

/// Cards shown on the placeholder image.
pub const MAX_ACTIVE_CHANNELS: usize = 15;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveChannel {
    /// Display label, `#` followed by the channel id.
    pub number: String,
    pub id: i64,
    pub name: String,
    pub logo_url: Option<String>,
}

impl ActiveChannel {
    fn sort_key(&self) -> u64 {
        self.number
            .trim_start_matches('#')
            .parse::<u64>()
            .unwrap_or(u64::MAX)
    }
}

/// What the placeholder image shows and what change detection compares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveSnapshot {
    /// Every live channel key, sorted, including channels already on the
    /// fallback.
    pub uuids: Vec<String>,
    pub channels: Vec<ActiveChannel>,
}

impl ActiveSnapshot {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Reads the live relay sessions from the shared store and joins them with
/// the catalog.
pub struct ActiveStreams {
    store: Arc<dyn StateStore>,
    catalog: Arc<dyn Catalog>,
    fallback_url: String,
    key_pattern: Regex,
}

impl fmt::Debug for ActiveStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveStreams")
            .field("fallback_url", &self.fallback_url)
            .finish()
    }
}

impl ActiveStreams {
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: Arc<dyn Catalog>,
        fallback_url: impl Into<String>,
    ) -> Self {
        let key_pattern =
            Regex::new(r"^ts_proxy:channel:(.*):metadata$").expect("valid regex");
        Self {
            store,
            catalog,
            fallback_url: fallback_url.into(),
            key_pattern,
        }
    }

    pub async fn collect(&self) -> SnapshotResult<ActiveSnapshot> {
        let mut uuids: Vec<String> = self
            .store
            .scan(keys::ACTIVE_CHANNEL_PATTERN)
            .await?
            .iter()
            .filter_map(|key| self.key_pattern.captures(key))
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .collect();
        uuids.sort();
        uuids.dedup();
        if uuids.is_empty() {
            return Ok(ActiveSnapshot::default());
        }

        let parsed: Vec<Uuid> = uuids
            .iter()
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .collect();
        let mut channels = Vec::new();
        let found =
            catalog::blocking(&self.catalog, move |catalog| catalog.channels_by_uuid(&parsed))
                .await?;
        for channel in found {
            let url = self
                .store
                .hget(&keys::channel_metadata(&channel.uuid), "url")
                .await?;
            if url.as_deref() == Some(self.fallback_url.as_str()) {
                debug!(channel_id = channel.id, "channel already on fallback");
                continue;
            }
            channels.push(ActiveChannel {
                number: format!("#{}", channel.id),
                id: channel.id,
                name: channel.name,
                logo_url: channel.logo_url,
            });
        }
        channels.sort_by_key(ActiveChannel::sort_key);
        channels.truncate(MAX_ACTIVE_CHANNELS);
        Ok(ActiveSnapshot { uuids, channels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::store::MemoryStateStore;

    fn live(store: &MemoryStateStore, uuid: &Uuid, url: &str) {
        store.hset(&keys::channel_metadata(uuid), "url", url);
    }

    #[tokio::test]
    async fn skips_fallback_channels_and_orders_by_number() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("catalog.db")).unwrap());
        catalog.initialize().unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let fallback = "http://127.0.0.1:9000/stream.ts";

        let mut expected = Vec::new();
        for (name, url) in [
            ("News", "http://upstream/a"),
            ("Sports", fallback),
            ("Movies", "http://upstream/c"),
        ] {
            let uuid = Uuid::new_v4();
            let channel = catalog.add_channel(name, uuid, None).unwrap();
            live(&store, &uuid, url);
            expected.push((channel.id, uuid, url == fallback));
        }
        // relay session for a channel unknown to the catalog
        live(&store, &Uuid::new_v4(), "http://upstream/z");

        let snapshot = ActiveStreams::new(store.clone(), catalog.clone(), fallback)
            .collect()
            .await
            .unwrap();

        assert_eq!(snapshot.uuids.len(), 4);
        let mut sorted = snapshot.uuids.clone();
        sorted.sort();
        assert_eq!(snapshot.uuids, sorted);

        let names: Vec<&str> = snapshot.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["News", "Movies"]);
        assert_eq!(snapshot.channels[0].number, format!("#{}", expected[0].0));
    }

    #[tokio::test]
    async fn caps_the_card_count() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("catalog.db")).unwrap());
        catalog.initialize().unwrap();
        let store = Arc::new(MemoryStateStore::new());
        for idx in 0..20 {
            let uuid = Uuid::new_v4();
            catalog
                .add_channel(&format!("Channel {idx}"), uuid, None)
                .unwrap();
            live(&store, &uuid, "http://upstream/x");
        }

        let snapshot = ActiveStreams::new(store, catalog, "http://127.0.0.1:1/stream.ts")
            .collect()
            .await
            .unwrap();
        assert_eq!(snapshot.uuids.len(), 20);
        assert_eq!(snapshot.channels.len(), MAX_ACTIVE_CHANNELS);
        assert_eq!(snapshot.channels[0].name, "Channel 0");
    }

    #[tokio::test]
    async fn empty_store_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("catalog.db")).unwrap());
        catalog.initialize().unwrap();
        let snapshot = ActiveStreams::new(Arc::new(MemoryStateStore::new()), catalog, "x")
            .collect()
            .await
            .unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.uuids.is_empty());
    }
}
