use anyhow::{Context, Result};
use clap::Parser;
use duckflight_core::{DuckDbEngine, DuckFlightService, EngineConfig, FlightConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "duckflight-server")]
#[command(about = "Serve a DuckDB database over Arrow Flight SQL", long_about = None)]
struct Args {
    /// Database file; created if missing. In-memory when omitted
    #[arg(long, env = "DUCKFLIGHT_DB")]
    db: Option<PathBuf>,
    /// Listen address
    #[arg(long, env = "DUCKFLIGHT_BIND", default_value = "0.0.0.0:32010")]
    bind: String,
    /// Pooled engine connections (concurrent statements)
    #[arg(long, env = "DUCKFLIGHT_POOL_SIZE", default_value_t = 4)]
    pool_size: usize,
    /// Batches buffered between the engine and each stream
    #[arg(long, env = "DUCKFLIGHT_BATCH_BUFFER", default_value_t = 2)]
    batch_buffer: usize,
    /// Open the database file writable
    #[arg(long, env = "DUCKFLIGHT_READ_WRITE")]
    read_write: bool,
    /// Skip loading installed extensions at startup
    #[arg(long, env = "DUCKFLIGHT_NO_EXTENSIONS")]
    no_extensions: bool,
    /// Server name reported to clients
    #[arg(long, env = "DUCKFLIGHT_SERVER_NAME", default_value = "duckflight")]
    server_name: String,
    /// Tokio worker threads
    #[arg(long, env = "DUCKFLIGHT_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Maximum gRPC message size in bytes
    #[arg(long, env = "DUCKFLIGHT_MAX_MESSAGE_BYTES", default_value_t = 64 * 1024 * 1024)]
    max_message_bytes: usize,
}

fn main() -> Result<()> {
    let log_format = std::env::var("DUCKFLIGHT_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    }

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", args.bind))?;

    let mut engine_config = match &args.db {
        Some(path) => EngineConfig::new(path),
        None => EngineConfig::in_memory(),
    };
    engine_config = engine_config
        .with_read_only(!args.read_write)
        .with_pool_size(args.pool_size)
        .with_batch_buffer(args.batch_buffer)
        .with_load_extensions(!args.no_extensions);

    // Opening may create the file and load extensions; keep it off the runtime threads.
    let engine = tokio::task::spawn_blocking(move || DuckDbEngine::open(engine_config))
        .await
        .context("engine startup task failed")?
        .context("failed to open database")?;

    let flight_config = FlightConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        max_message_size: args.max_message_bytes,
        ..Default::default()
    }
    .with_server_name(args.server_name.clone())
    .with_stream_buffer(args.batch_buffer);

    info!(
        address = %flight_config.address(),
        db = %args
            .db
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".into()),
        pool_size = engine.config().pool_size,
        read_only = engine.read_only(),
        version = %engine.version(),
        extensions = engine.loaded_extensions().len(),
        "starting flight server"
    );

    let service = DuckFlightService::for_duckdb(engine, flight_config);
    tonic::transport::Server::builder()
        .add_service(service.into_server())
        .serve_with_shutdown(addr, shutdown_signal())
        .await
        .context("flight server failed")?;

    info!("flight server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        info!("received SIGINT, initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                let _ = ctrl_c.await;
                info!("received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received shutdown signal, initiating graceful shutdown");
    }
}
