use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tms_core::admission::fallback_url;
use tms_core::{
    load_deployment_config, AdmissionController, BulkOutcome, Collaborators, DeploymentConfig,
    FallbackSource, RedisStateStore, RefreshSignal, Resolution, SettingsStore, SqliteCatalog,
    StoreChannelLifecycle, TmsSettings, TooManyStreams,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] tms_core::ConfigError),
    #[error("state store error: {0}")]
    Store(#[from] tms_core::StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] tms_core::CatalogError),
    #[error("admission error: {0}")]
    Admission(#[from] tms_core::AdmissionError),
    #[error("server error: {0}")]
    Server(#[from] tms_core::ServerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid setting assignment {0:?}, expected key=value")]
    InvalidAssignment(String),
    #[error("cannot resolve server address {0}")]
    UnresolvedAddress(String),
    #[error("server.port is 0; set the port the server listens on")]
    EphemeralPort,
    #[error("too many streams could not start, see the log for the cause")]
    Disabled,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Too Many Streams control interface", long_about = None)]
pub struct Cli {
    /// Deployment config file
    #[arg(long, default_value = "configs/tms.toml")]
    pub config: PathBuf,
    /// Persisted settings file, overriding the deployment config
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// Channel catalog database, overriding the deployment config
    #[arg(long)]
    pub catalog_db: Option<PathBuf>,
    /// Redis URL, overriding the deployment config
    #[arg(long)]
    pub redis_url: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the fallback broadcast server until Ctrl-C
    Serve,
    /// Picks a source and profile for one channel
    Resolve(ResolveArgs),
    /// Attaches the fallback source to every channel
    Apply,
    /// Detaches the fallback source from every channel
    Remove,
    /// Shows, saves or reloads settings
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Channel id
    #[arg(long)]
    pub channel: i64,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Prints the resolved settings
    Show,
    /// Writes settings to the persisted file
    Save(ConfigSaveArgs),
    /// Drops cached settings and resolves them again
    Reload,
}

#[derive(Args, Debug)]
pub struct ConfigSaveArgs {
    /// Setting to store, as key=value; repeatable
    #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
    pub assignments: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(args.shell, &mut Cli::command(), "tmsctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    init_tracing(&context.settings.get()?);

    match &cli.command {
        Commands::Serve => context.serve(cli.format).await?,
        Commands::Resolve(args) => {
            let report = context.resolve(args.channel).await?;
            render(&report, cli.format)?;
        }
        Commands::Apply => {
            let outcome = context.controller().await?.apply_to_all_channels().await?;
            render(&BulkReport::new("applied", outcome), cli.format)?;
        }
        Commands::Remove => {
            let outcome = context
                .controller()
                .await?
                .remove_from_all_channels()
                .await?;
            render(&BulkReport::new("removed", outcome), cli.format)?;
        }
        Commands::Config(ConfigCommands::Show) => {
            render(&context.settings_report()?, cli.format)?;
        }
        Commands::Config(ConfigCommands::Save(args)) => {
            context.save_settings(&args.assignments)?;
            render(&context.settings_report()?, cli.format)?;
        }
        Commands::Config(ConfigCommands::Reload) => {
            context.settings.reload()?;
            render(&context.settings_report()?, cli.format)?;
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

/// `RUST_LOG` wins over the resolved `tms_log_level`.
fn init_tracing(settings: &TmsSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter()));
    // a second install, as in tests, keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    config: DeploymentConfig,
    settings: SettingsStore,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("settings", &self.settings.path())
            .finish()
    }
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config =
            load_deployment_config(&cli.config)?.with_env_overrides(|key| std::env::var(key).ok());
        if let Some(path) = &cli.settings {
            config.settings_path = path.clone();
        }
        if let Some(path) = &cli.catalog_db {
            config.catalog_db = path.clone();
        }
        if let Some(url) = &cli.redis_url {
            config.redis_url = url.clone();
        }
        let settings = SettingsStore::new(&config.settings_path);
        Ok(Self { config, settings })
    }

    fn catalog(&self) -> Result<Arc<SqliteCatalog>> {
        let catalog = SqliteCatalog::new(&self.config.catalog_db)?;
        catalog.initialize()?;
        Ok(Arc::new(catalog))
    }

    async fn store(&self) -> Result<Arc<RedisStateStore>> {
        Ok(Arc::new(RedisStateStore::connect(&self.config.redis_url).await?))
    }

    /// Controller for one-shot commands. Without a server in this process
    /// the fallback URL is derived from the configured bind address.
    async fn controller(&self) -> Result<AdmissionController> {
        let catalog = self.catalog()?;
        let store = self.store().await?;
        let url = self.configured_fallback_url().await?;
        let lifecycle = Arc::new(StoreChannelLifecycle::new(store.clone(), "tmsctl"));
        Ok(AdmissionController::new(
            catalog.clone(),
            store,
            FallbackSource::new(catalog, lifecycle, url),
            Arc::new(RefreshSignal::new()),
        ))
    }

    async fn configured_fallback_url(&self) -> Result<String> {
        let server = &self.config.server;
        if server.port == 0 {
            return Err(AppError::EphemeralPort);
        }
        let target = format!("{}:{}", server.host, server.port);
        let addr = tokio::net::lookup_host(target.as_str())
            .await?
            .next()
            .ok_or_else(|| AppError::UnresolvedAddress(target.clone()))?;
        Ok(fallback_url(addr))
    }

    async fn resolve(&self, channel_id: i64) -> Result<ResolutionReport> {
        let resolution = self.controller().await?.try_resolve(channel_id).await?;
        Ok(ResolutionReport {
            channel_id,
            resolution,
        })
    }

    async fn serve(&self, format: OutputFormat) -> Result<()> {
        let store = self.store().await?;
        let collaborators = Collaborators {
            lifecycle: Arc::new(StoreChannelLifecycle::new(store.clone(), "tmsctl")),
            store,
            catalog: self.catalog()?,
        };
        let settings = SettingsStore::new(self.settings.path());
        let feature = TooManyStreams::initialize(&self.config, settings, collaborators)
            .await
            .ok_or(AppError::Disabled)?;
        render(
            &ServeReport {
                addr: feature.addr().to_string(),
                fallback_url: feature.fallback_url().to_string(),
            },
            format,
        )?;

        tokio::signal::ctrl_c().await?;
        info!("interrupt received, stopping");
        feature.shutdown().await?;
        Ok(())
    }

    fn settings_report(&self) -> Result<SettingsReport> {
        Ok(SettingsReport {
            path: self.settings.path().to_path_buf(),
            settings: self.settings.get()?,
        })
    }

    /// Merges the assignments into the persisted file, keeping keys it
    /// already holds.
    fn save_settings(&self, assignments: &[String]) -> Result<()> {
        let mut persisted = self.settings.load_persisted();
        for assignment in assignments {
            let (key, value) = parse_assignment(assignment)?;
            persisted.insert(key, value);
        }
        self.settings.save(&persisted)?;
        Ok(())
    }
}

/// `key=value`, where the value is read as JSON when it parses and as a
/// plain string otherwise.
fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .ok_or_else(|| AppError::InvalidAssignment(raw.to_string()))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

#[derive(Debug, Serialize)]
pub struct ResolutionReport {
    pub channel_id: i64,
    #[serde(flatten)]
    pub resolution: Resolution,
}

impl DisplayFallback for ResolutionReport {
    fn display(&self) -> String {
        match self.resolution {
            Resolution::Assigned {
                source_id,
                profile_id,
            } => format!(
                "channel {}: source={source_id} profile={profile_id}",
                self.channel_id
            ),
            Resolution::Fallback { source_id } => format!(
                "channel {}: fallback source={source_id}",
                self.channel_id
            ),
            Resolution::Rejected { reason } => {
                format!("channel {}: rejected ({reason})", self.channel_id)
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BulkReport {
    pub action: &'static str,
    #[serde(flatten)]
    pub outcome: BulkOutcome,
}

impl BulkReport {
    fn new(action: &'static str, outcome: BulkOutcome) -> Self {
        Self { action, outcome }
    }
}

impl DisplayFallback for BulkReport {
    fn display(&self) -> String {
        let mut line = format!(
            "Fallback source {} on {} of {} channels",
            self.action, self.outcome.changed, self.outcome.channels
        );
        if self.outcome.failed > 0 {
            line.push_str(&format!(" ({} failed)", self.outcome.failed));
        }
        line
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsReport {
    pub path: PathBuf,
    pub settings: TmsSettings,
}

impl DisplayFallback for SettingsReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Settings file: {}", self.path.display())];
        let fields = match serde_json::to_value(&self.settings) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in fields {
            let value = match value {
                Value::String(text) => text,
                Value::Null => "-".to_string(),
                other => other.to_string(),
            };
            lines.push(format!("  {key} = {value}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ServeReport {
    pub addr: String,
    pub fallback_url: String,
}

impl DisplayFallback for ServeReport {
    fn display(&self) -> String {
        format!(
            "Serving on {} (fallback source {}), Ctrl-C to stop",
            self.addr, self.fallback_url
        )
    }
}
