use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use memcp_config::ConfigHandle;
use memcp_memory::{
    EmbeddedIndex, MemoryEngine, OperationLog, PersonaRegistry, VectorIndex, load_model_ports,
    spawn_workers,
};

#[derive(Debug, Parser)]
#[command(
    name = "memcp",
    version,
    about = "Persistent memory service for conversational AI agents"
)]
struct Cli {
    /// Path to the JSON configuration file. Environment variables with the
    /// MEMORY_MCP_ prefix layer underneath it.
    #[arg(long, default_value = "config/memcp.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the service until SIGINT/SIGTERM (the default).
    Serve,
    /// Validate the effective configuration and exit.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // A config or validation failure here is the non-zero exit path.
    let config = Arc::new(
        ConfigHandle::load(Some(cli.config.clone()))
            .with_context(|| format!("loading configuration from {}", cli.config.display()))?,
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Check => {
            let _log_guard = init_tracing(None);
            let snapshot = config.current();
            println!("configuration ok");
            println!("- config file : {}", cli.config.display());
            println!("- data_dir    : {}", snapshot.data_dir);
            println!("- timezone    : {}", snapshot.timezone);
            println!("- server      : {}:{}", snapshot.server_host, snapshot.server_port);
            println!("- rebuild     : {:?}", snapshot.vector_rebuild.mode);
            println!(
                "- auto_cleanup: {}",
                if snapshot.auto_cleanup.enabled { "enabled" } else { "disabled" }
            );
            Ok(())
        }
        Commands::Serve => {
            let log_dir = config.current().data_dir().join("logs");
            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("creating log directory {}", log_dir.display()))?;
            let _log_guard = init_tracing(Some(&log_dir));
            serve(config).await
        }
    }
}

/// Console logging always; when serving, events are also mirrored into a
/// daily rolling file under the data root. The returned guard must stay
/// alive for the process lifetime so buffered lines are flushed.
fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::from_default_env();
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "memcp.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}

async fn serve(config: Arc<ConfigHandle>) -> Result<()> {
    let snapshot = config.current();
    let data_dir = snapshot.data_dir();
    std::fs::create_dir_all(data_dir.join("logs"))
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    std::fs::create_dir_all(data_dir.join("cache"))?;

    let ports = load_model_ports(&snapshot, &data_dir.join("cache"));
    let vector = build_vector_index(&snapshot)?;
    let registry = Arc::new(PersonaRegistry::new(&data_dir));
    let oplog = Arc::new(OperationLog::new(data_dir.join("logs").join("operations.log")));

    let engine = Arc::new(MemoryEngine::new(
        registry,
        vector,
        ports.embedder,
        ports.reranker,
        oplog,
        Arc::clone(&config),
    ));

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(Arc::clone(&engine), &shutdown_tx);

    info!(
        host = %snapshot.server_host,
        port = snapshot.server_port,
        data_dir = %data_dir.display(),
        semantic_search = engine.embedder().is_some(),
        "memcp ready; engine serving the RPC transport layer"
    );

    wait_for_shutdown().await?;
    info!("shutdown signal received; stopping workers");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    info!("memcp stopped");
    Ok(())
}

fn build_vector_index(snapshot: &memcp_config::AppConfig) -> Result<Arc<dyn VectorIndex>> {
    #[cfg(feature = "qdrant")]
    if let Some(url) = &snapshot.qdrant_url {
        let index = memcp_memory::QdrantIndex::connect(url)
            .with_context(|| format!("connecting to qdrant at {url}"))?;
        return Ok(Arc::new(index));
    }

    #[cfg(not(feature = "qdrant"))]
    if snapshot.qdrant_url.is_some() {
        tracing::warn!(
            "qdrant_url is configured but this build lacks the 'qdrant' feature; using the embedded index"
        );
    }

    Ok(Arc::new(EmbeddedIndex::new()))
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
