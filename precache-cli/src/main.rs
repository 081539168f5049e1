use std::sync::Arc;

use clap::Parser;
use error::AppError;
use indicatif::MultiProgress;
use precache_engine::{
    CacheProxy, DynamicRegistry, FileStore, HttpNetwork, Manifest, ProxyHost, create_client,
};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod commands;
mod config;
mod error;
mod utils;

use cli::{CliArgs, Command};
use commands::{CliHost, CommandExecutor};
use utils::progress::ProgressManager;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("precache.log")?;

    let multi_writer = MakeWriterExt::and(std::io::stdout, log_file);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(multi_writer)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("Precache - offline-first caching proxy. Part of the rust-srec project by hua0512");
    info!("==================================================================");

    let proxy_config = config::build_proxy_config(&args)?;
    info!(
        prefix = %proxy_config.prefix,
        version = %proxy_config.version,
        origin = %proxy_config.origin,
        "Proxy configuration"
    );

    let manifest = match args.manifest.as_ref() {
        Some(path) => {
            let manifest = Manifest::load(path).await?;
            info!("Loaded {} resources from {}", manifest.len(), path.display());
            manifest
        }
        None => Manifest::default(),
    };

    let store = FileStore::new(args.store_dir.clone()).await?;
    info!("Using partition store at {}", store.root().display());

    let client = create_client(&proxy_config.http)?;

    // Progress bars are the only client of a one-shot process
    let multi = MultiProgress::new();
    let progress_manager = if args.show_progress {
        ProgressManager::new(multi)
    } else {
        ProgressManager::new_disabled(multi)
    };
    let clients = Arc::new(DynamicRegistry::new());
    if !progress_manager.is_disabled() {
        clients.register(Arc::new(progress_manager));
    }

    let proxy = CacheProxy::new(
        proxy_config,
        manifest,
        ProxyHost {
            store: Arc::new(store),
            network: Arc::new(HttpNetwork::new(client)),
            clients,
            controller: Arc::new(CliHost),
        },
    );
    let executor = CommandExecutor::new(Arc::new(proxy));

    match args.command {
        Command::Install { stage_only } => executor.install(stage_only).await?,
        Command::Get {
            path,
            navigate,
            output,
        } => executor.get(&path, navigate, output.as_deref()).await?,
        Command::DownloadOffline => executor.download_offline().await?,
        Command::Partitions { json } => executor.partitions(json).await?,
        Command::Sweep => executor.sweep().await?,
    }
    Ok(())
}
