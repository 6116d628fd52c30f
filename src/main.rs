//! plc-historian - poll PLC tags into a SQLite time series

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plc_historian::config::{self, Config};
use plc_historian::scheduler::StopHandle;
use plc_historian::store::parse_time;
use plc_historian::{api, telemetry, ControllerPool, PollScheduler, SqliteStore, TagRegistry};

#[derive(Parser)]
#[command(name = "plc-historian", version, about = "Poll PLC tags into a SQLite time series")]
struct Cli {
    /// Path to the YAML configuration (e.g. ./configs/tags.yaml)
    #[arg(short, long, env = "PLC_HISTORIAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collector until SIGINT/SIGTERM (default)
    Run,
    /// Write a wide CSV of good samples in a time window
    Export {
        /// Fully-qualified tag names, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        tags: Vec<String>,
        /// Window start, RFC 3339 or nanoseconds
        #[arg(long)]
        start: String,
        /// Window end, RFC 3339 or nanoseconds
        #[arg(long)]
        end: String,
        /// Output file; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = config::resolve_config_path(cli.config.as_deref())?;
    let config = config::load_config(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Configuration loaded: {}", config_path.display());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Export {
            tags,
            start,
            end,
            out,
        } => export(&config, tags, &start, &end, out).await,
    }
}

async fn run(config: Config) -> Result<()> {
    let registry = Arc::new(TagRegistry::from_config(&config)?);
    info!(
        "Registry: {} controllers, {} tags",
        registry.controllers().count(),
        registry.tag_count()
    );

    if config.metrics.enabled {
        telemetry::install_exporter(&config.metrics)?;
    }

    let read_timeout = config.polling.timeout_ms.map(Duration::from_millis);
    let pool = ControllerPool::from_registry(&registry, read_timeout);
    let mut scheduler = PollScheduler::new(
        registry,
        pool,
        config.database.path.clone(),
        Duration::from_millis(config.polling.interval_ms),
    );
    let stop = scheduler.stop_handle();

    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            stop.stop();
        }
    });

    let api_task = if config.server.enabled {
        Some(spawn_api(&config, stop.clone()).await?)
    } else {
        None
    };

    let result = scheduler.start().await;

    // the API shuts down on the same stop signal; a failed start never raised it
    stop.stop();
    if let Some(task) = api_task {
        if let Err(e) = task.await {
            error!("Query API task failed: {}", e);
        }
    }

    let summary = result?;
    info!("Collector finished: {:?}", summary);
    Ok(())
}

async fn spawn_api(config: &Config, stop: StopHandle) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| "Invalid server listen address")?;

    let store = SqliteStore::open(&config.database.path)
        .await
        .with_context(|| "Failed to open store for the query API")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Query API listening on http://{}", addr);
    Ok(tokio::spawn(async move {
        if let Err(e) = api::serve(listener, store, stop).await {
            error!("Query API error: {}", e);
        }
    }))
}

async fn export(
    config: &Config,
    tags: Vec<String>,
    start: &str,
    end: &str,
    out: Option<PathBuf>,
) -> Result<()> {
    let start = parse_time(start).map_err(|e| anyhow!(e))?;
    let end = parse_time(end).map_err(|e| anyhow!(e))?;

    let store = SqliteStore::open(&config.database.path).await?;
    let matrix = store.feature_matrix(&tags, start, end).await?;
    store.close().await;

    if matrix.is_empty() {
        warn!("No good samples for {:?} between {} and {}", tags, start, end);
    }

    match out {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            matrix.write_csv(file)?;
            info!(
                "Exported {} rows x {} tags to {}",
                matrix.timestamps.len(),
                matrix.tags.len(),
                path.display()
            );
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            matrix.write_csv(&mut lock)?;
            lock.flush()?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
