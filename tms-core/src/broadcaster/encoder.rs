use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SettingsStore;
use crate::render::ImageProducer;
use crate::snapshot::ActiveSnapshot;

use super::error::{ServerError, ServerResult};

/// How long a stopping encoder gets to exit on its own before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

pub type EncoderOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Lifecycle handle of one running encoder process.
#[async_trait]
pub trait EncoderControl: Send + Sync {
    async fn has_exited(&self) -> bool;
    /// Asks the process to quit, waiting at most `grace` before killing it.
    async fn terminate(&self, grace: Duration);
}

pub struct LaunchedEncoder {
    pub output: EncoderOutput,
    pub control: Box<dyn EncoderControl>,
}

/// Starts encoders reading a still image. Tests substitute an in-memory
/// pipe for the process.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn launch(&self, image: &Path) -> ServerResult<LaunchedEncoder>;
}

pub fn encoder_args(image: &Path, codec: &str) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-loop".to_string(),
        "1".to_string(),
        "-framerate".to_string(),
        "1".to_string(),
        "-i".to_string(),
        image.to_string_lossy().to_string(),
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        "anullsrc=r=48000:cl=stereo".to_string(),
        "-c:v".to_string(),
        codec.to_string(),
    ];
    if codec == "libx264" {
        args.extend(
            ["-preset", "ultrafast", "-tune", "stillimage"]
                .iter()
                .map(|arg| arg.to_string()),
        );
    }
    args.extend(
        [
            "-r", "1", "-g", "1", "-b:v", "800k", "-c:a", "aac", "-b:a", "96k", "-f", "mpegts",
            "pipe:1",
        ]
        .iter()
        .map(|arg| arg.to_string()),
    );
    args
}

/// Runs the ffmpeg binary with stdout piped back to the server.
pub struct FfmpegLauncher {
    program: PathBuf,
    settings: Arc<SettingsStore>,
}

impl fmt::Debug for FfmpegLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegLauncher")
            .field("program", &self.program)
            .finish()
    }
}

impl FfmpegLauncher {
    pub fn new(program: impl Into<PathBuf>, settings: Arc<SettingsStore>) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    fn codec(&self) -> String {
        match self.settings.get() {
            Ok(settings) if !settings.video_codec.trim().is_empty() => settings.video_codec,
            Ok(_) => "libx264".to_string(),
            Err(err) => {
                warn!(error = %err, "using default video codec");
                "libx264".to_string()
            }
        }
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self, image: &Path) -> ServerResult<LaunchedEncoder> {
        let args = encoder_args(image, &self.codec());
        let mut command = Command::new(&self.program);
        for arg in &args {
            command.arg(arg);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| ServerError::Spawn {
            source,
            program: self.program.clone(),
        })?;
        let stdout = child.stdout.take().ok_or(ServerError::MissingOutput)?;
        let stdin = child.stdin.take();
        debug!(program = %self.program.display(), args = %args.join(" "), "spawned encoder");
        Ok(LaunchedEncoder {
            output: Box::new(stdout),
            control: Box::new(ChildControl {
                child: Mutex::new(child),
                stdin: Mutex::new(stdin),
            }),
        })
    }
}

struct ChildControl {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
}

#[async_trait]
impl EncoderControl for ChildControl {
    async fn has_exited(&self) -> bool {
        match self.child.lock().await.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "failed to poll encoder");
                true
            }
        }
    }

    async fn terminate(&self, grace: Duration) {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        // ffmpeg finishes cleanly on `q`; closing stdin afterwards covers
        // builds that ignore it.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.write_all(b"q").await;
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "encoder exited"),
            Ok(Err(err)) => warn!(error = %err, "failed to wait for encoder"),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill encoder");
                }
            }
        }
    }
}

/// One running encoder, tagged with the generation that launched it.
pub struct Encoder {
    generation: u64,
    output: Mutex<EncoderOutput>,
    control: Box<dyn EncoderControl>,
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoder")
            .field("generation", &self.generation)
            .finish()
    }
}

impl Encoder {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fills `buf` unless the output ends first. Returns the bytes read;
    /// zero means end of stream.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut output = self.output.lock().await;
        let mut filled = 0;
        while filled < buf.len() {
            let read = output.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }

    pub async fn has_exited(&self) -> bool {
        self.control.has_exited().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderState {
    Stopped,
    Starting,
    Running,
}

/// Owns the designated encoder and serializes every restart of it.
pub struct EncoderSupervisor {
    launcher: Arc<dyn EncoderLauncher>,
    producer: Arc<dyn ImageProducer>,
    current: StdMutex<Option<Arc<Encoder>>>,
    state: StdMutex<EncoderState>,
    restart: Mutex<()>,
    generation: AtomicU64,
    requested: AtomicU64,
    served: AtomicU64,
    launches: AtomicU64,
}

impl fmt::Debug for EncoderSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderSupervisor")
            .field("state", &self.state())
            .field("generation", &self.generation.load(Ordering::Acquire))
            .finish()
    }
}

impl EncoderSupervisor {
    pub fn new(launcher: Arc<dyn EncoderLauncher>, producer: Arc<dyn ImageProducer>) -> Self {
        Self {
            launcher,
            producer,
            current: StdMutex::new(None),
            state: StdMutex::new(EncoderState::Stopped),
            restart: Mutex::new(()),
            generation: AtomicU64::new(0),
            requested: AtomicU64::new(0),
            served: AtomicU64::new(0),
            launches: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<Arc<Encoder>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> EncoderState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch attempts so far, successful or not.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Acquire)
    }

    /// Replaces the running encoder with a fresh one. Callers queued behind
    /// an in-flight restart that began after their request share its result.
    pub async fn start(&self) -> ServerResult<()> {
        let ticket = self.requested.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = self.restart.lock().await;
        if self.served.load(Ordering::Acquire) >= ticket {
            debug!(ticket, "restart already covered");
            return Ok(());
        }
        self.served
            .store(self.requested.load(Ordering::Acquire), Ordering::Release);
        self.relaunch().await
    }

    /// Starts an encoder only when none is designated.
    pub async fn start_if_absent(&self) -> ServerResult<()> {
        let _guard = self.restart.lock().await;
        if self.current().is_some() {
            return Ok(());
        }
        self.relaunch().await
    }

    /// Restarts only if `generation` is still the designated encoder, so a
    /// process already replaced elsewhere is not restarted twice.
    pub async fn restart_if_current(&self, generation: u64) -> ServerResult<bool> {
        let _guard = self.restart.lock().await;
        match self.current() {
            Some(encoder) if encoder.generation() == generation => {
                warn!(generation, "encoder exited, restarting");
                self.relaunch().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn shutdown(&self) {
        let _guard = self.restart.lock().await;
        if let Some(encoder) = self.take_current() {
            encoder.control.terminate(STOP_GRACE).await;
            info!(generation = encoder.generation(), "encoder stopped");
        }
        self.set_state(EncoderState::Stopped);
    }

    async fn relaunch(&self) -> ServerResult<()> {
        self.set_state(EncoderState::Starting);
        if let Some(previous) = self.take_current() {
            previous.control.terminate(STOP_GRACE).await;
        }

        let image = self.producer.output_path().to_path_buf();
        if !image.exists() {
            if let Err(err) = self.producer.render(&ActiveSnapshot::default(), true).await {
                error!(error = %err, "failed to render initial image");
            }
        }

        self.launches.fetch_add(1, Ordering::AcqRel);
        match self.launcher.launch(&image).await {
            Ok(launched) => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let encoder = Arc::new(Encoder {
                    generation,
                    output: Mutex::new(launched.output),
                    control: launched.control,
                });
                *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(encoder);
                self.set_state(EncoderState::Running);
                info!(generation, image = %image.display(), "encoder started");
                Ok(())
            }
            Err(err) => {
                self.set_state(EncoderState::Stopped);
                error!(error = %err, "failed to start encoder");
                Err(err)
            }
        }
    }

    fn take_current(&self) -> Option<Arc<Encoder>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_state(&self, state: EncoderState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::PipeLauncher;
    use super::*;
    use crate::render::StaticImage;

    fn supervisor(launcher: Arc<PipeLauncher>, image: &Path) -> Arc<EncoderSupervisor> {
        Arc::new(EncoderSupervisor::new(
            launcher,
            Arc::new(StaticImage::new(image)),
        ))
    }

    #[test]
    fn x264_gets_still_image_tuning() {
        let args = encoder_args(Path::new("/tmp/card.jpg"), "libx264");
        let joined = args.join(" ");
        assert!(joined.contains("-loop 1 -framerate 1 -i /tmp/card.jpg"));
        assert!(joined.contains("-c:v libx264 -preset ultrafast -tune stillimage"));
        assert!(joined.ends_with("-f mpegts pipe:1"));

        let args = encoder_args(Path::new("/tmp/card.jpg"), "h264_nvenc");
        assert!(!args.iter().any(|arg| arg == "stillimage"));
        assert!(args.join(" ").contains("-c:v h264_nvenc -r 1"));
    }

    #[tokio::test]
    async fn restarts_replace_the_designated_encoder() {
        let launcher = Arc::new(PipeLauncher::default());
        let supervisor = supervisor(launcher.clone(), Path::new("/tmp/tms-static.jpg"));
        assert_eq!(supervisor.state(), EncoderState::Stopped);

        supervisor.start().await.unwrap();
        let first = supervisor.current().unwrap();
        supervisor.start().await.unwrap();
        let second = supervisor.current().unwrap();
        assert!(second.generation() > first.generation());
        assert!(first.has_exited().await);
        assert_eq!(supervisor.state(), EncoderState::Running);

        // stale generation is ignored
        assert!(!supervisor.restart_if_current(first.generation()).await.unwrap());
        assert!(supervisor
            .restart_if_current(second.generation())
            .await
            .unwrap());
        assert_eq!(supervisor.launches(), 3);

        supervisor.start_if_absent().await.unwrap();
        assert_eq!(supervisor.launches(), 3);

        supervisor.shutdown().await;
        assert!(supervisor.current().is_none());
        assert_eq!(supervisor.state(), EncoderState::Stopped);
    }

    #[tokio::test]
    async fn read_chunk_fills_until_end_of_stream() {
        let launcher = Arc::new(PipeLauncher::default());
        let supervisor = supervisor(launcher.clone(), Path::new("/tmp/tms-static.jpg"));
        supervisor.start().await.unwrap();
        let encoder = supervisor.current().unwrap();

        launcher.feed_latest(&[7u8; 10]).await;
        launcher.feed_latest(&[8u8; 6]).await;
        launcher.close_latest().await;

        let mut buf = [0u8; 12];
        assert_eq!(encoder.read_chunk(&mut buf).await.unwrap(), 12);
        assert_eq!(encoder.read_chunk(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], &[8u8; 4]);
        assert_eq!(encoder.read_chunk(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queued_restarts_collapse_into_one() {
        let launcher = Arc::new(PipeLauncher::default());
        let supervisor = supervisor(launcher.clone(), Path::new("/tmp/tms-static.jpg"));

        let held = supervisor.restart.lock().await;
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.start().await })
            })
            .collect();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(held);
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(supervisor.launches(), 1);
        assert_eq!(supervisor.current().unwrap().generation(), 1);
    }

    #[tokio::test]
    async fn failed_launch_leaves_no_encoder() {
        let launcher = Arc::new(PipeLauncher::default());
        launcher.fail.store(true, Ordering::SeqCst);
        let supervisor = supervisor(launcher.clone(), Path::new("/tmp/tms-static.jpg"));
        assert!(supervisor.start().await.is_err());
        assert!(supervisor.current().is_none());
        assert_eq!(supervisor.state(), EncoderState::Stopped);

        launcher.fail.store(false, Ordering::SeqCst);
        supervisor.start_if_absent().await.unwrap();
        assert!(supervisor.current().is_some());
    }
}
