//! Read access to the host's channel catalog plus the single write the
//! admission path needs: attaching and detaching the fallback source.

pub mod error;
pub mod store;

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

pub use error::{CatalogError, CatalogResult};
pub use store::{SqliteCatalog, SqliteCatalogBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub account_id: Option<i64>,
    pub is_custom: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub account_id: Option<i64>,
    pub is_custom: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub is_active: bool,
    pub is_default: bool,
    /// Concurrent connection ceiling; zero means unlimited.
    pub max_streams: u32,
}

impl Profile {
    pub fn is_unlimited(&self) -> bool {
        self.max_streams == 0
    }

    pub fn has_capacity(&self, current_connections: i64) -> bool {
        self.is_unlimited() || current_connections < i64::from(self.max_streams)
    }
}

/// Orders profiles with the default one first, keeping the relative order of
/// the rest.
pub fn default_first(mut profiles: Vec<Profile>) -> Vec<Profile> {
    profiles.sort_by_key(|profile| !profile.is_default);
    profiles
}

pub trait Catalog: Send + Sync {
    fn channel(&self, channel_id: i64) -> CatalogResult<Option<Channel>>;
    fn channels(&self) -> CatalogResult<Vec<Channel>>;
    fn channels_by_uuid(&self, uuids: &[Uuid]) -> CatalogResult<Vec<Channel>>;
    /// Sources of a channel in their configured order.
    fn channel_sources(&self, channel_id: i64) -> CatalogResult<Vec<Source>>;
    /// Profiles of an account in their stored order.
    fn account_profiles(&self, account_id: i64) -> CatalogResult<Vec<Profile>>;
    fn find_source(&self, name: &str, url: &str) -> CatalogResult<Option<Source>>;
    fn create_source(&self, source: &NewSource) -> CatalogResult<Source>;
    /// Returns `true` when the source was not attached before.
    fn attach_source(&self, channel_id: i64, source_id: i64, position: i64)
        -> CatalogResult<bool>;
    /// Returns `true` when the source was attached before.
    fn detach_source(&self, channel_id: i64, source_id: i64) -> CatalogResult<bool>;
}

/// Runs a catalog call on the blocking pool; SQLite calls may wait on the
/// host's write lock.
pub async fn blocking<T, F>(catalog: &Arc<dyn Catalog>, call: F) -> CatalogResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Catalog) -> CatalogResult<T> + Send + 'static,
{
    let catalog = Arc::clone(catalog);
    tokio::task::spawn_blocking(move || call(catalog.as_ref())).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: i64, is_default: bool) -> Profile {
        Profile {
            id,
            account_id: 1,
            name: format!("p{id}"),
            is_active: true,
            is_default,
            max_streams: 1,
        }
    }

    #[test]
    fn default_profile_moves_to_front_stably() {
        let ordered = default_first(vec![
            profile(1, false),
            profile(2, true),
            profile(3, false),
            profile(4, false),
        ]);
        let ids: Vec<i64> = ordered.iter().map(|profile| profile.id).collect();
        assert_eq!(ids, vec![2, 1, 3, 4]);
    }

    #[test]
    fn capacity_respects_unlimited_profiles() {
        let mut limited = profile(1, false);
        assert!(limited.has_capacity(0));
        assert!(!limited.has_capacity(1));
        limited.max_streams = 0;
        assert!(limited.has_capacity(10_000));
    }
}
