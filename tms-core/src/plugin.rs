//! Wires the admission controller and the broadcast server into one running
//! feature.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admission::{
    fallback_url, AdmissionController, ChannelLifecycle, FallbackSource, SourceResolver,
};
use crate::broadcaster::{self, BroadcastServer, FfmpegLauncher, ServerResult};
use crate::catalog::Catalog;
use crate::config::{DeploymentConfig, SettingsStore};
use crate::context::Context;
use crate::render::{CardRenderer, ImageProducer, LogoCache, StaticImage};
use crate::snapshot::ActiveStreams;
use crate::store::StateStore;

/// Host-provided collaborators.
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub catalog: Arc<dyn Catalog>,
    pub lifecycle: Arc<dyn ChannelLifecycle>,
}

pub struct TooManyStreams {
    context: Context,
    controller: Arc<AdmissionController>,
    server: Arc<BroadcastServer>,
    addr: SocketAddr,
    fallback_url: String,
    task: JoinHandle<ServerResult<()>>,
}

impl fmt::Debug for TooManyStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TooManyStreams")
            .field("addr", &self.addr)
            .field("fallback_url", &self.fallback_url)
            .finish()
    }
}

impl TooManyStreams {
    /// Starts the feature. Returns `None`, after logging why, when settings
    /// cannot be resolved, no encoder binary is available or the listen
    /// address cannot be bound; the host keeps its own source selection
    /// in that case.
    pub async fn initialize(
        config: &DeploymentConfig,
        settings: SettingsStore,
        collaborators: Collaborators,
    ) -> Option<Self> {
        let context = Context::new(settings);
        let settings = match context.settings().get() {
            Ok(settings) => settings,
            Err(err) => {
                error!(error = %err, "invalid settings, too many streams disabled");
                return None;
            }
        };

        let Some(ffmpeg) = resolve_ffmpeg(config.ffmpeg_path.as_deref()) else {
            error!("ffmpeg not found, too many streams disabled");
            return None;
        };

        let listener = match broadcaster::bind(&config.server.host, config.server.port).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "too many streams disabled");
                return None;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!(error = %err, "bound listener has no address");
                return None;
            }
        };
        let url = fallback_url(addr);

        let producer: Arc<dyn ImageProducer> = match settings.image_override() {
            Some(path) => {
                info!(path = %path.display(), "using static fallback image");
                Arc::new(StaticImage::new(path))
            }
            None => match LogoCache::new(&config.logo_cache_dir) {
                Ok(logos) => Arc::new(CardRenderer::new(
                    &config.image_path,
                    Arc::clone(context.settings()),
                    logos,
                )),
                Err(err) => {
                    error!(error = %err, "failed to build logo client, too many streams disabled");
                    return None;
                }
            },
        };

        let Collaborators {
            store,
            catalog,
            lifecycle,
        } = collaborators;
        let fallback = FallbackSource::new(Arc::clone(&catalog), lifecycle, url.clone());
        let controller = Arc::new(AdmissionController::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            fallback,
            Arc::clone(context.refresh()),
        ));
        let server = Arc::new(BroadcastServer::new(
            Arc::new(FfmpegLauncher::new(ffmpeg, Arc::clone(context.settings()))),
            producer,
            ActiveStreams::new(store, catalog, url.clone()),
            Arc::clone(context.refresh()),
        ));
        let task = tokio::spawn(Arc::clone(&server).run(listener));
        info!(%addr, fallback_url = %url, "too many streams enabled");

        Some(Self {
            context,
            controller,
            server,
            addr,
            fallback_url: url,
            task,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// The hook the host installs in place of its own source selection.
    pub fn resolver(&self) -> Arc<dyn SourceResolver> {
        Arc::clone(&self.controller) as Arc<dyn SourceResolver>
    }

    pub fn server(&self) -> &Arc<BroadcastServer> {
        &self.server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn fallback_url(&self) -> &str {
        &self.fallback_url
    }

    pub fn trigger_refresh(&self) {
        self.context.trigger_refresh();
    }

    /// Stops serving and terminates the encoder.
    pub async fn shutdown(self) -> ServerResult<()> {
        self.server.shutdown();
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "broadcast server task failed");
                Ok(())
            }
        }
    }
}

/// The configured binary when it exists, otherwise `ffmpeg` from `PATH`.
pub fn resolve_ffmpeg(configured: Option<&Path>) -> Option<PathBuf> {
    match configured {
        Some(path) if path.is_file() => Some(path.to_path_buf()),
        Some(path) => {
            warn!(path = %path.display(), "configured ffmpeg binary does not exist");
            None
        }
        None => find_in_path("ffmpeg"),
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
