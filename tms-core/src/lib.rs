pub mod admission;
pub mod broadcaster;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod plugin;
pub mod render;
pub mod snapshot;
pub mod sqlite;
pub mod store;

pub use admission::{
    AdmissionController, AdmissionError, AdmissionResult, BulkOutcome, ChannelLifecycle,
    FallbackSource, RejectReason, Resolution, SourceResolver, StoreChannelLifecycle,
};
pub use broadcaster::{BroadcastServer, ServerError, ServerResult};
pub use catalog::{Catalog, CatalogError, CatalogResult, Channel, Profile, Source, SqliteCatalog};
pub use config::{
    load_deployment_config, DeploymentConfig, ServerSection, SettingsStore, TmsSettings,
};
pub use context::{Context, RefreshSignal};
pub use error::{ConfigError, Result};
pub use plugin::{Collaborators, TooManyStreams};
pub use render::{CardRenderer, ImageProducer, RenderError, RenderResult, StaticImage};
pub use snapshot::{ActiveChannel, ActiveSnapshot, ActiveStreams};
pub use store::{MemoryStateStore, RedisStateStore, StateStore, StoreError, StoreResult};
