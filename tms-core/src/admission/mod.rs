//! Chooses the upstream source and connection profile for a channel.
//!
//! Session bindings and connection counters live in the shared state store
//! so every host process sees the same picture. When every active profile is
//! at its ceiling the channel is first rejected once, then switched to the
//! fallback source served by the broadcast server.

pub mod error;
pub mod fallback;
pub mod lifecycle;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{self, default_first, Catalog};
use crate::context::RefreshSignal;
use crate::store::{keys, read_counter, StateStore};

pub use error::{AdmissionError, AdmissionResult};
pub use fallback::{fallback_url, FallbackSource, FALLBACK_POSITION, FALLBACK_SOURCE_NAME};
pub use lifecycle::{ChannelLifecycle, StoreChannelLifecycle};

/// How long a saturation observation is remembered.
pub const MAXED_TTL: Duration = Duration::from_secs(30);
/// Observations needed before the fallback replaces the error.
pub const MAXED_THRESHOLD: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoStreamsAssigned,
    AllProfilesMaxed,
    NoCompatibleProfile,
    NoActiveProfiles,
    StateUnavailable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoStreamsAssigned => "No streams assigned to channel",
            RejectReason::AllProfilesMaxed => {
                "All profiles have reached maximum connection limits"
            }
            RejectReason::NoCompatibleProfile => "No compatible profile found",
            RejectReason::NoActiveProfiles => "No active profiles found",
            RejectReason::StateUnavailable => "Stream state is temporarily unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Assigned { source_id: i64, profile_id: i64 },
    Fallback { source_id: i64 },
    Rejected { reason: RejectReason },
}

impl Resolution {
    fn rejected(reason: RejectReason) -> Self {
        Resolution::Rejected { reason }
    }

    pub fn source_id(&self) -> Option<i64> {
        match self {
            Resolution::Assigned { source_id, .. } | Resolution::Fallback { source_id } => {
                Some(*source_id)
            }
            Resolution::Rejected { .. } => None,
        }
    }

    pub fn profile_id(&self) -> Option<i64> {
        match self {
            Resolution::Assigned { profile_id, .. } => Some(*profile_id),
            _ => None,
        }
    }

    pub fn error_reason(&self) -> Option<&'static str> {
        match self {
            Resolution::Rejected { reason } => Some(reason.as_str()),
            _ => None,
        }
    }

    /// The `(source, profile, error)` triple the host's selection hook
    /// expects.
    pub fn into_parts(self) -> (Option<i64>, Option<i64>, Option<String>) {
        (
            self.source_id(),
            self.profile_id(),
            self.error_reason().map(str::to_string),
        )
    }
}

/// Capability the host calls instead of its built-in source selection.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, channel_id: i64) -> Resolution;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub channels: usize,
    pub changed: usize,
    pub failed: usize,
}

pub struct AdmissionController {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn StateStore>,
    fallback: FallbackSource,
    refresh: Arc<RefreshSignal>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl AdmissionController {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn StateStore>,
        fallback: FallbackSource,
        refresh: Arc<RefreshSignal>,
    ) -> Self {
        Self {
            catalog,
            store,
            fallback,
            refresh,
        }
    }

    pub fn fallback(&self) -> &FallbackSource {
        &self.fallback
    }

    pub fn trigger_refresh(&self) {
        self.refresh.trigger();
    }

    /// Resolution with store and catalog failures surfaced to the caller.
    pub async fn try_resolve(&self, channel_id: i64) -> AdmissionResult<Resolution> {
        let sources =
            catalog::blocking(&self.catalog, move |catalog| catalog.channel_sources(channel_id))
                .await?;
        if sources.is_empty() {
            return Ok(Resolution::rejected(RejectReason::NoStreamsAssigned));
        }

        if let Some(bound) = self.restore_binding(channel_id).await? {
            debug!(channel_id, ?bound, "restored session binding");
            return Ok(bound);
        }

        let mut saw_active = false;
        let mut saw_saturated = false;
        for source in &sources {
            let Some(account_id) = source.account_id else {
                continue;
            };
            let profiles = catalog::blocking(&self.catalog, move |catalog| {
                catalog.account_profiles(account_id)
            })
            .await?;
            for profile in default_first(profiles) {
                if !profile.is_active {
                    continue;
                }
                saw_active = true;

                let counter = keys::profile_connections(profile.id);
                let current = read_counter(self.store.as_ref(), &counter).await?;
                if !profile.has_capacity(current) {
                    saw_saturated = true;
                    continue;
                }

                // count before binding so a failed count leaves no binding
                if !profile.is_unlimited() {
                    self.claim_connection(&counter, current).await?;
                }
                self.store
                    .set(&keys::channel_stream(channel_id), &source.id.to_string())
                    .await?;
                self.store
                    .set(&keys::stream_profile(source.id), &profile.id.to_string())
                    .await?;
                self.trigger_refresh();
                info!(
                    channel_id,
                    source_id = source.id,
                    profile_id = profile.id,
                    connections = current + 1,
                    max_streams = profile.max_streams,
                    "assigned source"
                );
                return Ok(Resolution::Assigned {
                    source_id: source.id,
                    profile_id: profile.id,
                });
            }
        }

        if saw_saturated {
            if !self.is_maxed(channel_id).await? {
                self.mark_maxed(channel_id).await?;
                info!(channel_id, "all profiles saturated, first observation");
                return Ok(Resolution::rejected(RejectReason::AllProfilesMaxed));
            }
            match self.fallback.find().await {
                Ok(Some(source)) => {
                    info!(channel_id, source_id = source.id, "serving fallback source");
                    return Ok(Resolution::Fallback {
                        source_id: source.id,
                    });
                }
                Ok(None) => warn!(channel_id, "fallback source missing after attach"),
                Err(err) => warn!(channel_id, error = %err, "failed to look up fallback source"),
            }
        }

        Ok(Resolution::rejected(if saw_active {
            RejectReason::NoCompatibleProfile
        } else {
            RejectReason::NoActiveProfiles
        }))
    }

    /// Increments a profile counter. A value the store cannot increment was
    /// read as zero, so it is overwritten with the count including this
    /// connection.
    async fn claim_connection(&self, counter: &str, current: i64) -> AdmissionResult<()> {
        if let Err(err) = self.store.incr(counter).await {
            warn!(counter, error = %err, "resetting unreadable connection counter");
            self.store.set(counter, &(current + 1).to_string()).await?;
        }
        Ok(())
    }

    async fn restore_binding(&self, channel_id: i64) -> AdmissionResult<Option<Resolution>> {
        let Some(source_id) = self
            .store
            .get(&keys::channel_stream(channel_id))
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        else {
            return Ok(None);
        };
        let profile_id = self
            .store
            .get(&keys::stream_profile(source_id))
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        Ok(profile_id.map(|profile_id| Resolution::Assigned {
            source_id,
            profile_id,
        }))
    }

    /// Whether the channel was seen saturated within [`MAXED_TTL`]. Also
    /// brings the fallback attachment in line with the answer; attachment
    /// failures are logged and do not change it.
    pub async fn is_maxed(&self, channel_id: i64) -> AdmissionResult<bool> {
        let count = read_counter(self.store.as_ref(), &keys::maxed_out(channel_id)).await?;
        let maxed = count >= MAXED_THRESHOLD;
        if maxed {
            if let Err(err) = self.attach_fallback(channel_id).await {
                warn!(channel_id, error = %err, "failed to attach fallback source");
            }
        } else if let Err(err) = self.detach_fallback(channel_id).await {
            warn!(channel_id, error = %err, "failed to detach fallback source");
        }
        Ok(maxed)
    }

    pub async fn mark_maxed(&self, channel_id: i64) -> AdmissionResult<()> {
        let key = keys::maxed_out(channel_id);
        self.store.incr(&key).await?;
        self.store.expire(&key, MAXED_TTL).await?;
        Ok(())
    }

    pub async fn attach_fallback(&self, channel_id: i64) -> AdmissionResult<bool> {
        let attached = self.fallback.attach(channel_id).await?;
        if attached {
            self.trigger_refresh();
        }
        Ok(attached)
    }

    pub async fn detach_fallback(&self, channel_id: i64) -> AdmissionResult<bool> {
        let detached = self.fallback.detach(channel_id).await?;
        if detached {
            self.trigger_refresh();
        }
        Ok(detached)
    }

    pub async fn apply_to_all_channels(&self) -> AdmissionResult<BulkOutcome> {
        let channels = catalog::blocking(&self.catalog, |catalog| catalog.channels()).await?;
        let mut outcome = BulkOutcome {
            channels: channels.len(),
            ..BulkOutcome::default()
        };
        for channel in channels {
            match self.attach_fallback(channel.id).await {
                Ok(true) => outcome.changed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(channel_id = channel.id, error = %err, "failed to attach fallback");
                    outcome.failed += 1;
                }
            }
        }
        info!(?outcome, "applied fallback source to channels");
        Ok(outcome)
    }

    pub async fn remove_from_all_channels(&self) -> AdmissionResult<BulkOutcome> {
        let channels = catalog::blocking(&self.catalog, |catalog| catalog.channels()).await?;
        let mut outcome = BulkOutcome {
            channels: channels.len(),
            ..BulkOutcome::default()
        };
        for channel in channels {
            match self.detach_fallback(channel.id).await {
                Ok(true) => outcome.changed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(channel_id = channel.id, error = %err, "failed to detach fallback");
                    outcome.failed += 1;
                }
            }
        }
        info!(?outcome, "removed fallback source from channels");
        Ok(outcome)
    }
}

#[async_trait]
impl SourceResolver for AdmissionController {
    async fn resolve(&self, channel_id: i64) -> Resolution {
        match self.try_resolve(channel_id).await {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(channel_id, error = %err, "admission failed closed");
                Resolution::rejected(RejectReason::StateUnavailable)
            }
        }
    }
}
