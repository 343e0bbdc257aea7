//! HTTP server that fans one still-image MPEG-TS encoder out to every
//! attached viewer.

pub mod clients;
pub mod encoder;
pub mod error;
pub mod http;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::RefreshSignal;
use crate::render::ImageProducer;
use crate::snapshot::{ActiveSnapshot, ActiveStreams};

pub use clients::{ClientId, ClientRegistry, CLIENT_QUEUE_CHUNKS};
pub use encoder::{
    encoder_args, Encoder, EncoderControl, EncoderLauncher, EncoderState, EncoderSupervisor,
    FfmpegLauncher, LaunchedEncoder,
};
pub use error::{ServerError, ServerResult};

/// Sixteen 188-byte TS packets, seven per 1316-byte datagram.
pub const CHUNK_SIZE: usize = 1316 * 16;
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(60);
/// Pause after an explicit refresh so the host's writes land first.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

const NO_ENCODER_BACKOFF: Duration = Duration::from_millis(500);
const IDLE_BACKOFF: Duration = Duration::from_secs(1);
const EOF_BACKOFF: Duration = Duration::from_millis(100);
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Binds the listener up front so a taken port disables the server before
/// anything else starts.
pub async fn bind(host: &str, port: u16) -> ServerResult<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { source, addr })
}

pub struct BroadcastServer {
    supervisor: Arc<EncoderSupervisor>,
    clients: Arc<ClientRegistry>,
    refresh: Arc<RefreshSignal>,
    snapshots: ActiveStreams,
    producer: Arc<dyn ImageProducer>,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for BroadcastServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastServer")
            .field("supervisor", &self.supervisor)
            .field("viewers", &self.clients.len())
            .finish()
    }
}

impl BroadcastServer {
    pub fn new(
        launcher: Arc<dyn EncoderLauncher>,
        producer: Arc<dyn ImageProducer>,
        snapshots: ActiveStreams,
        refresh: Arc<RefreshSignal>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            supervisor: Arc::new(EncoderSupervisor::new(launcher, producer.clone())),
            clients: Arc::new(ClientRegistry::new()),
            refresh,
            snapshots,
            producer,
            shutdown,
        }
    }

    pub fn supervisor(&self) -> &Arc<EncoderSupervisor> {
        &self.supervisor
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Stops the loops, ends every viewer response and lets `run` return.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Serves viewers on `listener` until [`BroadcastServer::shutdown`],
    /// then stops the encoder.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> ServerResult<()> {
        let addr = listener.local_addr()?;
        if let Err(err) = self.supervisor.start().await {
            warn!(error = %err, "initial encoder start failed, retrying from the broadcast loop");
        }
        let updater = tokio::spawn(Arc::clone(&self).update_loop());
        let broadcaster = tokio::spawn(Arc::clone(&self).broadcast_loop());

        let app = http::router(http::HttpState {
            clients: Arc::clone(&self.clients),
            refresh: Arc::clone(&self.refresh),
        });
        info!(%addr, "broadcast server listening");
        let mut stop = self.shutdown.subscribe();
        let clients = Arc::clone(&self.clients);
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                wait_for_shutdown(&mut stop).await;
                // viewer bodies end once their queues close
                clients.clear();
            })
            .await
            .map_err(|source| ServerError::Serve { source, addr });

        self.shutdown();
        for task in [updater, broadcaster] {
            if let Err(err) = task.await {
                warn!(error = %err, "server task ended abnormally");
            }
        }
        self.supervisor.shutdown().await;
        info!(%addr, "broadcast server stopped");
        served
    }

    async fn update_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        debug!("image updater started");
        self.refresh_image(false).await;
        loop {
            let signaled = tokio::select! {
                signaled = self.refresh.wait(REFRESH_TIMEOUT) => signaled,
                _ = wait_for_shutdown(&mut stop) => break,
            };
            if signaled && pause(&mut stop, SETTLE_DELAY).await {
                break;
            }
            self.refresh_image(signaled).await;
        }
        debug!("image updater stopped");
    }

    /// Redraws the image when the live channel set moved and restarts the
    /// encoder when the file was replaced.
    async fn refresh_image(&self, signaled: bool) {
        let (snapshot, changed) = match self.snapshots.collect().await {
            Ok(snapshot) => {
                let changed = self.producer.has_changed(&snapshot);
                (snapshot, changed)
            }
            Err(err) => {
                error!(error = %err, "failed to read active streams");
                (ActiveSnapshot::default(), true)
            }
        };
        if !changed && !signaled {
            return;
        }
        match self.producer.render(&snapshot, false).await {
            Ok(true) => {
                info!(
                    channels = snapshot.channels.len(),
                    "image updated, restarting encoder"
                );
                if let Err(err) = self.supervisor.start().await {
                    error!(error = %err, "encoder restart failed");
                }
            }
            Ok(false) => debug!("image unchanged"),
            Err(err) => error!(error = %err, "image update failed"),
        }
    }

    async fn broadcast_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut buf = vec![0u8; CHUNK_SIZE];
        debug!("broadcaster started");
        while !*stop.borrow() {
            let Some(encoder) = self.supervisor.current() else {
                if pause(&mut stop, NO_ENCODER_BACKOFF).await {
                    break;
                }
                if let Err(err) = self.supervisor.start_if_absent().await {
                    debug!(error = %err, "encoder still unavailable");
                }
                continue;
            };

            if self.clients.is_empty() {
                if pause(&mut stop, IDLE_BACKOFF).await {
                    break;
                }
                continue;
            }

            let read = tokio::select! {
                read = encoder.read_chunk(&mut buf) => read,
                _ = wait_for_shutdown(&mut stop) => break,
            };
            match read {
                Ok(0) => {
                    if encoder.has_exited().await {
                        if let Err(err) =
                            self.supervisor.restart_if_current(encoder.generation()).await
                        {
                            error!(error = %err, "encoder restart failed");
                        }
                    }
                    if pause(&mut stop, EOF_BACKOFF).await {
                        break;
                    }
                }
                Ok(read) => {
                    self.clients.broadcast(Bytes::copy_from_slice(&buf[..read]));
                }
                Err(err) => {
                    error!(error = %err, "failed to read encoder output");
                    if pause(&mut stop, READ_ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }
        debug!("broadcaster stopped");
    }
}

async fn wait_for_shutdown(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Sleeps for `duration`; returns `true` when shutdown arrived first.
async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = wait_for_shutdown(stop) => true,
    }
}
