use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::Level;

use quire_engine::{ExecutorConfig, ExecutorRegistry, RegistryConfig};
use quire_llm::LoremProvider;
use quire_server::ServerConfig;
use quire_store::Database;
use quire_telemetry::TelemetryConfig;

/// Streaming turn server.
#[derive(Debug, Parser)]
#[command(name = "quire", version)]
struct Cli {
    #[arg(long, env = "QUIRE_PORT", default_value_t = 9091)]
    port: u16,

    /// SQLite database file. Defaults to ~/.quire/quire.db.
    #[arg(long, env = "QUIRE_DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, env = "QUIRE_LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,

    /// Human-readable logs instead of JSON lines.
    #[arg(long, env = "QUIRE_PLAIN_LOGS")]
    plain_logs: bool,

    /// Also persist warn+ logs to this SQLite file.
    #[arg(long, env = "QUIRE_LOG_DB_PATH")]
    log_db_path: Option<PathBuf>,

    /// Per-subscriber event queue capacity.
    #[arg(long, env = "QUIRE_CLIENT_BUFFER", default_value_t = 256)]
    client_buffer: usize,

    #[arg(long, env = "QUIRE_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// How long finished turns stay available for reconnection.
    #[arg(long, env = "QUIRE_RETENTION_SECS", default_value_t = 600)]
    retention_secs: u64,

    #[arg(long, env = "QUIRE_DEFAULT_MODEL", default_value = "lorem-fast")]
    default_model: String,

    #[arg(long, env = "QUIRE_KEEP_ALIVE_SECS", default_value_t = 10)]
    keep_alive_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = quire_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: !cli.plain_logs,
        log_db_path: cli.log_db_path.clone(),
        ..Default::default()
    });

    let db_path = cli.db_path.clone().unwrap_or_else(default_db_path);
    let db = Database::open(&db_path).with_context(|| format!("opening database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let registry = ExecutorRegistry::start(RegistryConfig {
        sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
        retention: Duration::from_secs(cli.retention_secs),
    });

    let config = ServerConfig {
        port: cli.port,
        keep_alive: Duration::from_secs(cli.keep_alive_secs),
        default_model: cli.default_model,
        executor: ExecutorConfig {
            client_buffer: cli.client_buffer.max(1),
        },
    };
    let handle = quire_server::start(config, db, Arc::new(LoremProvider::new()), Arc::clone(&registry))
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "quire server ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    tracing::info!("shutting down");

    let interrupted = registry.interrupt_all();
    if interrupted > 0 {
        tracing::info!(interrupted, "interrupted streaming turns");
    }
    registry.shutdown();
    handle.shutdown().await;
    Ok(())
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".quire")
        .join("quire.db")
}
