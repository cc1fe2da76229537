use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, ensure, Context, Result};
use clap::{Parser, Subcommand};
use seedbridge_pipeline::{
    install_panic_hook, LocalFilesImportSignal, Pipeline, PipelineConfig, RestartPolicy,
    TracingNotifier,
};
use seedbridge_protocol::DEFAULT_MAX_METAINFO_BYTES;
use seedbridge_remote::InMemorySeedboxClient;
use seedbridge_rpc::{build_router, AppState, Credentials, RpcSettings};
use seedbridge_storage::{SqliteClaimStore, StorageConfig};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Seedbox to download-client RPC bridge daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve {
        #[arg(long, default_value = "config/seedbridge.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    storage: StorageSection,
    #[serde(default)]
    seedbox: SeedboxSection,
    #[serde(default)]
    downloads: DownloadsSection,
    #[serde(default)]
    polling: PollingSection,
    #[serde(default)]
    supervisor: SupervisorSection,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SeedboxSection {
    tag: String,
}

impl Default for SeedboxSection {
    fn default() -> Self {
        Self {
            tag: "seedbridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DownloadsSection {
    dir: PathBuf,
    concurrency: usize,
    max_metainfo_bytes: usize,
    release_claim_on_failure: bool,
}

impl Default for DownloadsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("downloads"),
            concurrency: 4,
            max_metainfo_bytes: DEFAULT_MAX_METAINFO_BYTES,
            release_claim_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct PollingSection {
    orchestrator_secs: u64,
    import_secs: u64,
    seed_secs: u64,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            orchestrator_secs: 60,
            import_secs: 60,
            seed_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SupervisorSection {
    max_restarts: u32,
    restart_delay_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let policy = RestartPolicy::default();
        Self {
            max_restarts: policy.max_restarts,
            restart_delay_secs: policy.delay.as_secs(),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        ensure!(!self.seedbox.tag.trim().is_empty(), "seedbox.tag must not be empty");
        ensure!(self.downloads.concurrency > 0, "downloads.concurrency must be positive");
        ensure!(
            self.downloads.max_metainfo_bytes > 0,
            "downloads.max_metainfo_bytes must be positive"
        );
        for (name, secs) in [
            ("polling.orchestrator_secs", self.polling.orchestrator_secs),
            ("polling.import_secs", self.polling.import_secs),
            ("polling.seed_secs", self.polling.seed_secs),
        ] {
            ensure!(secs > 0, "{name} must be positive");
        }
        Ok(())
    }

    fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.http.username, &self.http.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            })),
            (None, None) => Ok(None),
            _ => Err(anyhow!("http.username and http.password must be set together")),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();
    install_panic_hook();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
    }
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config_source = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    let config: RuntimeConfig = toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))?;
    config.validate()?;

    let credentials = config.credentials()?;
    let require_credentials = requires_credentials(&config.http.bind);
    if require_credentials && credentials.is_none() {
        return Err(anyhow!(
            "non-loopback bind {} requires http.username and http.password",
            config.http.bind
        ));
    }

    if !require_credentials {
        info!("loopback bind detected: basic auth optional");
    } else {
        warn!("non-loopback bind detected: basic auth enforced");
    }

    prepare_sqlite_dir(&config.storage.sqlite_path).await?;
    let claims = Arc::new(
        SqliteClaimStore::connect(&StorageConfig {
            sqlite_path: config.storage.sqlite_path.clone(),
        })
        .await?,
    );

    tokio::fs::create_dir_all(&config.downloads.dir)
        .await
        .with_context(|| format!("failed to create {}", config.downloads.dir.display()))?;

    let client = Arc::new(InMemorySeedboxClient::new());
    let shutdown = CancellationToken::new();

    let pipeline = Pipeline::new(
        PipelineConfig {
            tag: config.seedbox.tag.clone(),
            download_dir: config.downloads.dir.clone(),
            concurrency: config.downloads.concurrency,
            poll_interval: Duration::from_secs(config.polling.orchestrator_secs),
            import_interval: Duration::from_secs(config.polling.import_secs),
            seed_interval: Duration::from_secs(config.polling.seed_secs),
            release_claim_on_failure: config.downloads.release_claim_on_failure,
            restart: RestartPolicy {
                max_restarts: config.supervisor.max_restarts,
                delay: Duration::from_secs(config.supervisor.restart_delay_secs),
            },
        },
        client.clone(),
        claims,
        Arc::new(LocalFilesImportSignal),
        Arc::new(TracingNotifier),
        shutdown.clone(),
    );
    let tasks = pipeline.spawn();

    let state = AppState::new(
        client,
        RpcSettings {
            tag: config.seedbox.tag.clone(),
            download_dir: config.downloads.dir.display().to_string(),
            max_metainfo_bytes: config.downloads.max_metainfo_bytes,
            credentials,
        },
    );
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    info!(bind = %config.http.bind, tag = %config.seedbox.tag, "seedbridged listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("axum server failed");

    shutdown.cancel();
    for task in tasks {
        match task.await {
            Ok(exit) => info!(?exit, "background task stopped"),
            Err(err) => error!(error = %err, "background task join failed"),
        }
    }
    served
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => error!(error = %err, "failed to listen for ctrl-c; shutting down"),
    }
    shutdown.cancel();
}

/// sqlite creates the database file but not its directory.
async fn prepare_sqlite_dir(sqlite_path: &str) -> Result<()> {
    if sqlite_path.starts_with("sqlite:") || sqlite_path == ":memory:" {
        return Ok(());
    }
    match Path::new(sqlite_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display())),
        _ => Ok(()),
    }
}

fn requires_credentials(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}
