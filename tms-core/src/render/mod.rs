//! Placeholder image producers for the broadcast encoder.

pub mod card;
pub mod error;
pub mod font;
pub mod logo;

use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, RgbaImage};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::{SettingsStore, TmsSettings};
use crate::snapshot::ActiveSnapshot;

pub use error::{RenderError, RenderResult};
pub use logo::LogoCache;

pub const JPEG_QUALITY: u8 = 92;

/// Produces the still image the encoder loops over.
#[async_trait]
pub trait ImageProducer: Send + Sync {
    fn output_path(&self) -> &Path;

    /// Whether `snapshot` differs from what the current image shows.
    fn has_changed(&self, snapshot: &ActiveSnapshot) -> bool;

    /// Writes the image unless it is already current. Returns whether the
    /// file was replaced.
    async fn render(&self, snapshot: &ActiveSnapshot, force: bool) -> RenderResult<bool>;
}

/// Card grid of the channels still streaming, redrawn when the set of live
/// channels changes.
pub struct CardRenderer {
    output: PathBuf,
    settings: Arc<SettingsStore>,
    logos: LogoCache,
    last_uuids: Mutex<Option<Vec<String>>>,
}

impl fmt::Debug for CardRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardRenderer")
            .field("output", &self.output)
            .field("logos", &self.logos)
            .finish()
    }
}

impl CardRenderer {
    pub fn new(
        output: impl Into<PathBuf>,
        settings: Arc<SettingsStore>,
        logos: LogoCache,
    ) -> Self {
        Self {
            output: output.into(),
            settings,
            logos,
            last_uuids: Mutex::new(None),
        }
    }

    fn settings(&self) -> TmsSettings {
        self.settings.get().unwrap_or_else(|err| {
            warn!(error = %err, "falling back to default settings for rendering");
            TmsSettings::default()
        })
    }
}

#[async_trait]
impl ImageProducer for CardRenderer {
    fn output_path(&self) -> &Path {
        &self.output
    }

    fn has_changed(&self, snapshot: &ActiveSnapshot) -> bool {
        let last = self.last_uuids.lock().unwrap_or_else(PoisonError::into_inner);
        last.as_deref() != Some(snapshot.uuids.as_slice())
    }

    async fn render(&self, snapshot: &ActiveSnapshot, force: bool) -> RenderResult<bool> {
        if !force && !self.has_changed(snapshot) && self.output.exists() {
            return Ok(false);
        }

        let settings = self.settings();
        let mut logos = Vec::with_capacity(snapshot.channels.len());
        for channel in &snapshot.channels {
            let logo = match channel.logo_url.as_deref() {
                Some(url) => self.logos.get(url).await,
                None => None,
            };
            logos.push(logo);
        }

        let output = self.output.clone();
        let drawn = snapshot.clone();
        tokio::task::spawn_blocking(move || {
            let canvas = card::compose(&settings, &drawn, &logos);
            write_jpeg(&output, canvas)
        })
        .await??;

        *self.last_uuids.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(snapshot.uuids.clone());
        info!(
            path = %self.output.display(),
            channels = snapshot.channels.len(),
            "rendered placeholder image"
        );
        Ok(true)
    }
}

/// Replaces `path` with the encoded image in one rename so the encoder never
/// reads a partial file.
fn write_jpeg(path: &Path, canvas: RgbaImage) -> RenderResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|source| RenderError::Io {
        path: parent.to_path_buf(),
        source,
    })?;

    let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
    let mut temp = NamedTempFile::new_in(parent).map_err(|source| RenderError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ColorType::Rgb8,
        )?;
        writer.flush().map_err(|source| RenderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    temp.persist(path).map_err(|source| RenderError::Persist {
        source,
        path: path.to_path_buf(),
    })?;
    Ok(())
}

/// A fixed image configured by the operator; never redrawn.
#[derive(Debug, Clone)]
pub struct StaticImage {
    path: PathBuf,
}

impl StaticImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ImageProducer for StaticImage {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn has_changed(&self, _snapshot: &ActiveSnapshot) -> bool {
        false
    }

    async fn render(&self, _snapshot: &ActiveSnapshot, _force: bool) -> RenderResult<bool> {
        Ok(false)
    }
}
