//! sediment - a persistent, Redis-compatible key-value server backed by an
//! LSM engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use sediment::config::Config;
use sediment::server::Server;
use storage::Storage;

#[derive(Parser, Debug)]
#[command(name = "sediment")]
#[command(about = "A persistent, Redis-compatible key-value server")]
struct Args {
    /// Configuration file path (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory (holds the db and backup directories)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.dir {
        config.storage.db_dir = dir.join("db");
        config.storage.backup_dir = dir.join("backup");
    }
    if let Some(log_level) = args.log_level {
        config.server.log_level = log_level;
    }

    let level = match config.server.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    std::fs::create_dir_all(&config.storage.db_dir)?;
    std::fs::create_dir_all(&config.storage.backup_dir)?;

    let config = Arc::new(config);
    let storage = Arc::new(Storage::new(Arc::new(config.storage.clone())));
    storage.open().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(db_dir = %config.storage.db_dir.display(), "storage is ready");

    let server = Arc::new(Server::new(config, storage));
    server.start_cron();
    server.serve().await
}
