use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tms_core::admission::{FALLBACK_SOURCE_NAME, MAXED_TTL};
use tms_core::catalog::NewSource;
use tms_core::store::keys;
use tms_core::{
    AdmissionController, AdmissionResult, Catalog, CatalogError, CatalogResult, Channel,
    ChannelLifecycle, FallbackSource, MemoryStateStore, Profile, RefreshSignal, RejectReason,
    Resolution, Source, SourceResolver, SqliteCatalog, StateStore, StoreError, StoreResult,
};
use uuid::Uuid;

const FALLBACK_URL: &str = "http://127.0.0.1:5000/stream.ts";

#[derive(Default)]
struct RecordingLifecycle {
    stopped: Mutex<Vec<Uuid>>,
}

impl RecordingLifecycle {
    fn stopped(&self) -> Vec<Uuid> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelLifecycle for RecordingLifecycle {
    async fn stop_channel(&self, channel_uuid: Uuid) -> AdmissionResult<()> {
        self.stopped.lock().unwrap().push(channel_uuid);
        Ok(())
    }
}

struct UnreachableStore;

#[async_trait]
impl StateStore for UnreachableStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Err(StoreError::WrongType(key.to_string()))
    }
    async fn set(&self, key: &str, _value: &str) -> StoreResult<()> {
        Err(StoreError::WrongType(key.to_string()))
    }
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        Err(StoreError::WrongType(key.to_string()))
    }
    async fn expire(&self, key: &str, _ttl: Duration) -> StoreResult<()> {
        Err(StoreError::WrongType(key.to_string()))
    }
    async fn delete(&self, key: &str) -> StoreResult<()> {
        Err(StoreError::WrongType(key.to_string()))
    }
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::WrongType(pattern.to_string()))
    }
    async fn hget(&self, key: &str, _field: &str) -> StoreResult<Option<String>> {
        Err(StoreError::WrongType(key.to_string()))
    }
    async fn publish(&self, channel: &str, _message: &str) -> StoreResult<()> {
        Err(StoreError::WrongType(channel.to_string()))
    }
}

/// Memory store whose connection counters can be read but never written.
#[derive(Default)]
struct FrozenCounters {
    inner: MemoryStateStore,
}

#[async_trait]
impl StateStore for FrozenCounters {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        if key.starts_with("profile_connections:") {
            return Err(StoreError::WrongType(key.to_string()));
        }
        self.inner.set(key, value).await
    }
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        Err(StoreError::NotAnInteger(key.to_string()))
    }
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.expire(key, ttl).await
    }
    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.inner.scan(pattern).await
    }
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.inner.hget(key, field).await
    }
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.inner.publish(channel, message).await
    }
}

/// Catalog where the fallback source can be neither found nor created.
struct NoFallbackCatalog {
    inner: SqliteCatalog,
    lookup_fails: bool,
}

impl Catalog for NoFallbackCatalog {
    fn channel(&self, channel_id: i64) -> CatalogResult<Option<Channel>> {
        self.inner.channel(channel_id)
    }
    fn channels(&self) -> CatalogResult<Vec<Channel>> {
        self.inner.channels()
    }
    fn channels_by_uuid(&self, uuids: &[Uuid]) -> CatalogResult<Vec<Channel>> {
        self.inner.channels_by_uuid(uuids)
    }
    fn channel_sources(&self, channel_id: i64) -> CatalogResult<Vec<Source>> {
        self.inner.channel_sources(channel_id)
    }
    fn account_profiles(&self, account_id: i64) -> CatalogResult<Vec<Profile>> {
        self.inner.account_profiles(account_id)
    }
    fn find_source(&self, _name: &str, _url: &str) -> CatalogResult<Option<Source>> {
        if self.lookup_fails {
            Err(CatalogError::MissingStore)
        } else {
            Ok(None)
        }
    }
    fn create_source(&self, _source: &NewSource) -> CatalogResult<Source> {
        Err(CatalogError::MissingStore)
    }
    fn attach_source(
        &self,
        channel_id: i64,
        source_id: i64,
        position: i64,
    ) -> CatalogResult<bool> {
        self.inner.attach_source(channel_id, source_id, position)
    }
    fn detach_source(&self, channel_id: i64, source_id: i64) -> CatalogResult<bool> {
        self.inner.detach_source(channel_id, source_id)
    }
}

struct Harness {
    _dir: TempDir,
    catalog: Arc<SqliteCatalog>,
    store: Arc<MemoryStateStore>,
    lifecycle: Arc<RecordingLifecycle>,
    refresh: Arc<RefreshSignal>,
    controller: AdmissionController,
}

fn temp_catalog(dir: &Path) -> Arc<SqliteCatalog> {
    let catalog = SqliteCatalog::builder()
        .path(dir.join("catalog.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create catalog");
    catalog.initialize().expect("initialize catalog");
    Arc::new(catalog)
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let catalog = temp_catalog(dir.path());
    let store = Arc::new(MemoryStateStore::new());
    let lifecycle = Arc::new(RecordingLifecycle::default());
    let refresh = Arc::new(RefreshSignal::new());
    let controller = AdmissionController::new(
        catalog.clone(),
        store.clone(),
        FallbackSource::new(catalog.clone(), lifecycle.clone(), FALLBACK_URL),
        refresh.clone(),
    );
    Harness {
        _dir: dir,
        catalog,
        store,
        lifecycle,
        refresh,
        controller,
    }
}

impl Harness {
    /// A channel with one provider source whose account has a single profile.
    fn channel_with_profile(&self, name: &str, max_streams: u32) -> (i64, i64, i64) {
        let channel = self.catalog.add_channel(name, Uuid::new_v4(), None).unwrap();
        let account = self.catalog.add_account(&format!("{name} provider")).unwrap();
        let profile = self
            .catalog
            .add_profile(account, "main", true, true, max_streams)
            .unwrap();
        let source = self
            .catalog
            .add_source(
                channel.id,
                &NewSource {
                    name: format!("{name} feed"),
                    url: format!("http://provider/{name}.ts"),
                    account_id: Some(account),
                    is_custom: false,
                },
            )
            .unwrap();
        (channel.id, source.id, profile.id)
    }

    async fn connections(&self, profile_id: i64) -> Option<String> {
        self.store
            .get(&keys::profile_connections(profile_id))
            .await
            .unwrap()
    }

    fn fallback_attached(&self, channel_id: i64) -> bool {
        self.catalog
            .channel_sources(channel_id)
            .unwrap()
            .iter()
            .any(|source| source.name == FALLBACK_SOURCE_NAME && source.url == FALLBACK_URL)
    }
}

#[tokio::test]
async fn channel_without_sources_is_rejected() {
    let h = harness();
    let channel = h.catalog.add_channel("Empty", Uuid::new_v4(), None).unwrap();
    assert_eq!(
        h.controller.resolve(channel.id).await,
        Resolution::Rejected {
            reason: RejectReason::NoStreamsAssigned
        }
    );
}

#[tokio::test]
async fn assignment_binds_and_counts_the_connection() {
    let h = harness();
    let (channel, source, profile) = h.channel_with_profile("News", 2);

    let resolution = h.controller.resolve(channel).await;
    assert_eq!(
        resolution,
        Resolution::Assigned {
            source_id: source,
            profile_id: profile
        }
    );
    assert_eq!(
        h.store.get(&keys::channel_stream(channel)).await.unwrap(),
        Some(source.to_string())
    );
    assert_eq!(
        h.store.get(&keys::stream_profile(source)).await.unwrap(),
        Some(profile.to_string())
    );
    assert_eq!(h.connections(profile).await.as_deref(), Some("1"));
    assert!(h.refresh.is_set());
}

#[tokio::test]
async fn existing_binding_is_reused_without_counting_again() {
    let h = harness();
    let (channel, source, profile) = h.channel_with_profile("Sports", 1);

    let first = h.controller.resolve(channel).await;
    // the profile is now at its ceiling, but the session keeps its binding
    let second = h.controller.resolve(channel).await;
    assert_eq!(first, second);
    assert_eq!(second.source_id(), Some(source));
    assert_eq!(second.profile_id(), Some(profile));
    assert_eq!(h.connections(profile).await.as_deref(), Some("1"));
}

#[tokio::test]
async fn default_profile_is_tried_first() {
    let h = harness();
    let channel = h.catalog.add_channel("Movies", Uuid::new_v4(), None).unwrap();
    let account = h.catalog.add_account("provider").unwrap();
    let secondary = h.catalog.add_profile(account, "backup", true, false, 5).unwrap();
    let default = h.catalog.add_profile(account, "main", true, true, 5).unwrap();
    h.catalog
        .add_source(
            channel.id,
            &NewSource {
                name: "movies".into(),
                url: "http://provider/movies.ts".into(),
                account_id: Some(account),
                is_custom: false,
            },
        )
        .unwrap();

    let resolution = h.controller.resolve(channel.id).await;
    assert_eq!(resolution.profile_id(), Some(default.id));
    assert!(h.connections(secondary.id).await.is_none());
}

#[tokio::test]
async fn saturated_default_spills_to_the_next_profile() {
    let h = harness();
    let (channel, _, default) = h.channel_with_profile("Kids", 1);
    let account = h.catalog.channel_sources(channel).unwrap()[0]
        .account_id
        .unwrap();
    let spare = h.catalog.add_profile(account, "spare", true, false, 1).unwrap();
    h.store
        .set(&keys::profile_connections(default), "1")
        .await
        .unwrap();

    let resolution = h.controller.resolve(channel).await;
    assert_eq!(resolution.profile_id(), Some(spare.id));
}

#[tokio::test]
async fn unlimited_profiles_are_not_counted() {
    let h = harness();
    let (channel, _, profile) = h.channel_with_profile("Music", 0);

    assert!(h.controller.resolve(channel).await.profile_id().is_some());
    assert!(h.connections(profile).await.is_none());
}

#[tokio::test]
async fn inactive_profiles_are_never_used() {
    let h = harness();
    let (channel, _, profile) = h.channel_with_profile("Weather", 3);
    h.catalog.set_profile_active(profile, false).unwrap();

    assert_eq!(
        h.controller.resolve(channel).await,
        Resolution::Rejected {
            reason: RejectReason::NoActiveProfiles
        }
    );
    assert!(h.connections(profile).await.is_none());
}

#[tokio::test]
async fn saturation_is_debounced_before_the_fallback_is_served() {
    let h = harness();
    let (channel, _, profile) = h.channel_with_profile("Drama", 1);
    h.store
        .set(&keys::profile_connections(profile), "1")
        .await
        .unwrap();

    assert_eq!(
        h.controller.resolve(channel).await,
        Resolution::Rejected {
            reason: RejectReason::AllProfilesMaxed
        }
    );
    assert!(!h.fallback_attached(channel));

    let second = h.controller.resolve(channel).await;
    let fallback = h
        .controller
        .fallback()
        .find()
        .await
        .unwrap()
        .expect("fallback source");
    assert_eq!(
        second,
        Resolution::Fallback {
            source_id: fallback.id
        }
    );
    assert_eq!(second.into_parts(), (Some(fallback.id), None, None));
    assert!(h.fallback_attached(channel));
    assert!(fallback.is_custom);
    assert!(fallback.account_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn expired_saturation_detaches_and_stops_the_relay() {
    let h = harness();
    let (channel, _, profile) = h.channel_with_profile("Docs", 1);
    h.store
        .set(&keys::profile_connections(profile), "1")
        .await
        .unwrap();

    h.controller.resolve(channel).await;
    assert!(matches!(
        h.controller.resolve(channel).await,
        Resolution::Fallback { .. }
    ));

    tokio::time::advance(MAXED_TTL + Duration::from_secs(1)).await;

    // a new saturation window starts with a fresh rejection
    assert_eq!(
        h.controller.resolve(channel).await,
        Resolution::Rejected {
            reason: RejectReason::AllProfilesMaxed
        }
    );
    assert!(!h.fallback_attached(channel));
    let uuid = h.catalog.channel(channel).unwrap().unwrap().uuid;
    assert_eq!(h.lifecycle.stopped(), vec![uuid]);
}

#[tokio::test]
async fn connection_counters_only_grow() {
    let h = harness();
    let (first, source, profile) = h.channel_with_profile("Shared", 3);
    let second = h.catalog.add_channel("Shared 2", Uuid::new_v4(), None).unwrap();
    let shared = h.catalog.channel_sources(first).unwrap().remove(0);
    h.catalog.attach_source(second.id, shared.id, 0).unwrap();
    assert_eq!(shared.id, source);

    h.controller.resolve(first).await;
    h.controller.resolve(second.id).await;
    assert_eq!(h.connections(profile).await.as_deref(), Some("2"));

    // nothing here releases a slot; the host's relay owns the decrement
    h.store.delete(&keys::channel_stream(first)).await.unwrap();
    h.controller.resolve(first).await;
    assert_eq!(h.connections(profile).await.as_deref(), Some("3"));
}

#[tokio::test]
async fn fallback_can_be_applied_to_and_removed_from_every_channel() {
    let h = harness();
    let (first, _, _) = h.channel_with_profile("One", 1);
    let (second, _, _) = h.channel_with_profile("Two", 1);

    let applied = h.controller.apply_to_all_channels().await.unwrap();
    assert_eq!((applied.channels, applied.changed, applied.failed), (2, 2, 0));
    assert!(h.fallback_attached(first));
    assert!(h.fallback_attached(second));

    let again = h.controller.apply_to_all_channels().await.unwrap();
    assert_eq!(again.changed, 0);

    let removed = h.controller.remove_from_all_channels().await.unwrap();
    assert_eq!((removed.channels, removed.changed, removed.failed), (2, 2, 0));
    assert!(!h.fallback_attached(first));
    assert_eq!(h.lifecycle.stopped().len(), 2);
}

#[tokio::test]
async fn store_failures_fail_closed() {
    let dir = TempDir::new().unwrap();
    let catalog = temp_catalog(dir.path());
    let channel = catalog.add_channel("Offline", Uuid::new_v4(), None).unwrap();
    let account = catalog.add_account("provider").unwrap();
    catalog.add_profile(account, "main", true, true, 1).unwrap();
    catalog
        .add_source(
            channel.id,
            &NewSource {
                name: "offline".into(),
                url: "http://provider/offline.ts".into(),
                account_id: Some(account),
                is_custom: false,
            },
        )
        .unwrap();
    let controller = AdmissionController::new(
        catalog.clone(),
        Arc::new(UnreachableStore),
        FallbackSource::new(
            catalog,
            Arc::new(RecordingLifecycle::default()),
            FALLBACK_URL,
        ),
        Arc::new(RefreshSignal::new()),
    );

    assert!(controller.try_resolve(channel.id).await.is_err());
    let resolution = controller.resolve(channel.id).await;
    assert_eq!(
        resolution,
        Resolution::Rejected {
            reason: RejectReason::StateUnavailable
        }
    );
    assert_eq!(
        resolution.error_reason(),
        Some("Stream state is temporarily unavailable")
    );
}

#[tokio::test]
async fn unreadable_counter_is_replaced_by_the_claimed_count() {
    let h = harness();
    let (channel, source, profile) = h.channel_with_profile("Garbled", 2);
    h.store
        .set(&keys::profile_connections(profile), "garbage")
        .await
        .unwrap();

    assert_eq!(
        h.controller.resolve(channel).await,
        Resolution::Assigned {
            source_id: source,
            profile_id: profile
        }
    );
    assert_eq!(h.connections(profile).await.as_deref(), Some("1"));
}

#[tokio::test]
async fn uncounted_connection_leaves_no_binding() {
    let dir = TempDir::new().unwrap();
    let catalog = temp_catalog(dir.path());
    let channel = catalog.add_channel("Frozen", Uuid::new_v4(), None).unwrap();
    let account = catalog.add_account("provider").unwrap();
    catalog.add_profile(account, "main", true, true, 2).unwrap();
    catalog
        .add_source(
            channel.id,
            &NewSource {
                name: "frozen".into(),
                url: "http://provider/frozen.ts".into(),
                account_id: Some(account),
                is_custom: false,
            },
        )
        .unwrap();
    let store = Arc::new(FrozenCounters::default());
    let controller = AdmissionController::new(
        catalog.clone(),
        store.clone(),
        FallbackSource::new(
            catalog,
            Arc::new(RecordingLifecycle::default()),
            FALLBACK_URL,
        ),
        Arc::new(RefreshSignal::new()),
    );

    for _ in 0..2 {
        assert_eq!(
            controller.resolve(channel.id).await,
            Resolution::Rejected {
                reason: RejectReason::StateUnavailable
            }
        );
    }
    assert!(store
        .get(&keys::channel_stream(channel.id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn missing_fallback_source_degrades_to_no_compatible_profile() {
    for lookup_fails in [false, true] {
        let dir = TempDir::new().unwrap();
        let inner = SqliteCatalog::builder()
            .path(dir.path().join("catalog.sqlite"))
            .create_if_missing(true)
            .build()
            .unwrap();
        inner.initialize().unwrap();
        let channel = inner.add_channel("Lost", Uuid::new_v4(), None).unwrap();
        let account = inner.add_account("provider").unwrap();
        let profile = inner.add_profile(account, "main", true, true, 1).unwrap();
        inner
            .add_source(
                channel.id,
                &NewSource {
                    name: "lost".into(),
                    url: "http://provider/lost.ts".into(),
                    account_id: Some(account),
                    is_custom: false,
                },
            )
            .unwrap();
        let catalog = Arc::new(NoFallbackCatalog {
            inner,
            lookup_fails,
        });
        let store = Arc::new(MemoryStateStore::new());
        store
            .set(&keys::profile_connections(profile.id), "1")
            .await
            .unwrap();
        let controller = AdmissionController::new(
            catalog.clone(),
            store,
            FallbackSource::new(
                catalog,
                Arc::new(RecordingLifecycle::default()),
                FALLBACK_URL,
            ),
            Arc::new(RefreshSignal::new()),
        );

        assert_eq!(
            controller.resolve(channel.id).await,
            Resolution::Rejected {
                reason: RejectReason::AllProfilesMaxed
            }
        );
        assert_eq!(
            controller.resolve(channel.id).await,
            Resolution::Rejected {
                reason: RejectReason::NoCompatibleProfile
            }
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_attaches_share_one_fallback_source() {
    let h = Arc::new(harness());
    let channels: Vec<i64> = (0..16)
        .map(|n| h.channel_with_profile(&format!("Busy {n}"), 1).0)
        .collect();

    let tasks: Vec<_> = channels
        .iter()
        .map(|&channel| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.controller.attach_fallback(channel).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap());
    }

    let fallback_ids: HashSet<i64> = channels
        .iter()
        .flat_map(|&channel| h.catalog.channel_sources(channel).unwrap())
        .filter(|source| source.name == FALLBACK_SOURCE_NAME)
        .map(|source| source.id)
        .collect();
    assert_eq!(fallback_ids.len(), 1);

    let removed = h.controller.remove_from_all_channels().await.unwrap();
    assert_eq!(removed.changed, channels.len());
    assert!(channels.iter().all(|&channel| !h.fallback_attached(channel)));
}
