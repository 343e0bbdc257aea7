use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::error::{ConfigError, Result};

/// Widest grid the channel card layout can fit.
pub const MAX_COLUMNS: u32 = 15;

pub const DEFAULT_SETTINGS_PATH: &str =
    "/data/plugins/TMS_Persistent_Config/too_many_streams_persistent_config.json";

/// User-facing settings, the same fields the settings UI and the persisted
/// file carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmsSettings {
    pub stream_title: String,
    pub stream_description: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub stream_channel_cols: u32,
    pub tms_image_path: Option<PathBuf>,
    pub tms_log_level: String,
    pub theme_bg_color: String,
    pub theme_card_bg_color: String,
    pub theme_card_border_color: String,
    pub theme_text_color: String,
    pub theme_accent_color: String,
    pub theme_accent_text_color: String,
    pub video_codec: String,
}

impl Default for TmsSettings {
    fn default() -> Self {
        Self {
            stream_title: "Sorry, this channel is unavailable.".into(),
            stream_description: "While this channel is not currently available, here are some \
                                 other channels you can watch."
                .into(),
            stream_channel_cols: 5,
            tms_image_path: None,
            tms_log_level: "INFO".into(),
            theme_bg_color: "#0F172A".into(),
            theme_card_bg_color: "#1E293B".into(),
            theme_card_border_color: "#334155".into(),
            theme_text_color: "#F8FAFC".into(),
            theme_accent_color: "#38BDF8".into(),
            theme_accent_text_color: "#0F172A".into(),
            video_codec: "libx264".into(),
        }
    }
}

impl TmsSettings {
    /// Static image that replaces dynamic rendering, when one is configured.
    pub fn image_override(&self) -> Option<&Path> {
        self.tms_image_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn columns(&self) -> u32 {
        self.stream_channel_cols.clamp(1, MAX_COLUMNS)
    }

    /// `tms_log_level` translated into a tracing filter directive.
    pub fn log_filter(&self) -> String {
        match self.tms_log_level.trim().to_ascii_lowercase().as_str() {
            "warning" => "warn".to_string(),
            "critical" | "fatal" => "error".to_string(),
            "" => "info".to_string(),
            other => other.to_string(),
        }
    }
}

fn lenient_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Integer(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Integer(value) => u32::try_from(value).map_err(D::Error::custom),
        Raw::Float(value) => Ok(value.max(0.0) as u32),
        Raw::Text(text) => text.trim().parse().map_err(D::Error::custom),
    }
}

/// Merges the settings layers, lowest precedence first: defaults, stored UI
/// settings, the persisted file, then environment variables.
pub fn merge_settings<F>(
    stored: &Map<String, Value>,
    persisted: &Map<String, Value>,
    env: F,
) -> Result<TmsSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = match serde_json::to_value(TmsSettings::default())? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    overlay(&mut merged, stored);
    overlay(&mut merged, persisted);

    let mut environment = Map::new();
    if let Some(path) = env("TMS_IMAGE_PATH") {
        environment.insert("tms_image_path".into(), Value::String(path));
    }
    if let Some(level) = env("TMS_LOG_LEVEL").or_else(|| env("DISPATCHARR_LOG_LEVEL")) {
        environment.insert("tms_log_level".into(), Value::String(level));
    }
    if let Some(codec) = env("TMS_VIDEO_CODEC") {
        environment.insert("video_codec".into(), Value::String(codec));
    }
    overlay(&mut merged, &environment);

    let mut settings: TmsSettings = serde_json::from_value(Value::Object(merged))?;
    settings.tms_log_level = settings.tms_log_level.to_ascii_uppercase();
    Ok(settings)
}

fn overlay(target: &mut Map<String, Value>, layer: &Map<String, Value>) {
    for (key, value) in layer {
        if !value.is_null() {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Resolves and caches [`TmsSettings`] and owns the persisted settings file.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    stored: Map<String, Value>,
    cached: RwLock<Option<TmsSettings>>,
}

impl SettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stored: Map::new(),
            cached: RwLock::new(None),
        }
    }

    /// Settings kept by the host's settings UI.
    pub fn with_stored(mut self, stored: Map<String, Value>) -> Self {
        self.stored = stored;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted file. A missing or unreadable file yields an
    /// empty layer.
    pub fn load_persisted(&self) -> Map<String, Value> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no persisted settings file");
            return Map::new();
        }
        match read_json_object(&self.path) {
            Ok(map) => map,
            Err(err) => {
                error!(error = %err, "failed to load persisted settings");
                Map::new()
            }
        }
    }

    pub fn get(&self) -> Result<TmsSettings> {
        if let Some(settings) = self
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(settings.clone());
        }
        let persisted = self.load_persisted();
        let settings = merge_settings(&self.stored, &persisted, |key| std::env::var(key).ok())?;
        info!(?settings, "resolved settings");
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        Ok(settings)
    }

    /// Drops the cached settings and resolves them again.
    pub fn reload(&self) -> Result<TmsSettings> {
        self.clear_cache();
        self.get()
    }

    pub fn clear_cache(&self) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn save(&self, settings: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, content).map_err(|source| ConfigError::Io {
            source,
            path: self.path.clone(),
        })?;
        info!(path = %self.path.display(), "saved persisted settings");
        self.clear_cache();
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        source,
        path: path.to_path_buf(),
    })?;
    Ok(match value {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

/// Process-level settings that never reach the settings UI.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub redis_url: String,
    pub catalog_db: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub image_path: PathBuf,
    pub logo_cache_dir: PathBuf,
    pub settings_path: PathBuf,
    pub server: ServerSection,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".into(),
            catalog_db: PathBuf::from("data/catalog.sqlite"),
            ffmpeg_path: None,
            image_path: PathBuf::from("data/img/too_many_streams.jpg"),
            logo_cache_dir: PathBuf::from("/tmp/tms_logos"),
            settings_path: PathBuf::from(DEFAULT_SETTINGS_PATH),
            server: ServerSection::default(),
        }
    }
}

impl DeploymentConfig {
    /// Applies `TMS_HOST` and `TMS_PORT`.
    pub fn with_env_overrides<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = env("TMS_HOST").filter(|host| !host.trim().is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = env("TMS_PORT").and_then(|port| port.trim().parse().ok()) {
            self.server.port = port;
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

/// Loads the deployment file. A missing file yields the defaults.
pub fn load_deployment_config<P: AsRef<Path>>(path: P) -> Result<DeploymentConfig> {
    let path = path.as_ref();
    if !path.exists() {
        info!(path = %path.display(), "no deployment config, using defaults");
        return Ok(DeploymentConfig::default());
    }
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
