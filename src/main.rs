//! # Aqua Ingest
//!
//! Collect water-quality sensor readings over TCP into a JSON log.
//!
//! Sensor nodes open a connection, send one JSON object such as
//! `{"temp_c": 21.5, "tds": 340, "turbidity_v": 1.2, "ph": 7.4}` and read back
//! `OK` or `ERROR`. At most one reading per rate-limit window is stored; every
//! change to the log is committed and pushed with git when sync is enabled.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use aqua_ingest::config::{Config, GnssConfig};
use aqua_ingest::gnss::{modem, AtModem, GnssReader, PositionSource, PositionTracker};
use aqua_ingest::logging;
use aqua_ingest::ratelimit::RateLimiter;
use aqua_ingest::server::{send_payload, IngestionServer, ServerSettings};
use aqua_ingest::store::{EntryStore, RetryPolicy};
use aqua_ingest::sync::{GitNotifier, NoopNotifier, SyncNotifier, SyncWorker};

/// Longest wait for queued sync notifications at exit
const SYNC_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `send` waits for the server's answer
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file; built-in defaults are used if it does not exist
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Accept readings until Ctrl+C (default)
    Serve,
    /// Delete the most recent entry
    RemoveLast,
    /// Delete every entry
    RemoveAll,
    /// Print GNSS fixes until Ctrl+C
    Gnss,
    /// Send one JSON reading to a running server
    Send {
        json: String,
        #[arg(long, default_value = "127.0.0.1:5000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    let _log_guard = logging::init(&config.logging).context("failed to initialise logging")?;

    info!("Aqua Ingest v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::RemoveLast => remove_last(&config).await,
        Command::RemoveAll => remove_all(&config).await,
        Command::Gnss => gnss(&config.gnss).await,
        Command::Send { json, addr } => send(&addr, &json).await,
    }
}

/// Open the store with its sync worker attached
fn open_store(config: &Config) -> (Arc<EntryStore>, SyncWorker) {
    let notifier: Arc<dyn SyncNotifier> = if config.sync.enabled {
        info!("Sync enabled: git repository at {}", config.sync.repo_path);
        Arc::new(GitNotifier::from_config(&config.sync, Path::new(&config.store.path)))
    } else {
        Arc::new(NoopNotifier)
    };
    let (handle, worker) = SyncWorker::spawn(notifier);

    let store = EntryStore::new(&config.store.path)
        .with_retry(RetryPolicy::from_config(&config.store))
        .with_sync(handle);

    (Arc::new(store), worker)
}

async fn drain_sync(worker: SyncWorker) {
    match worker.shutdown(SYNC_DRAIN_TIMEOUT).await {
        Some(delivered) => info!("Sync queue drained ({} change(s) propagated)", delivered),
        None => warn!("Some changes were not propagated"),
    }
}

async fn serve(config: &Config) -> Result<()> {
    let (store, worker) = open_store(config);

    let existing = store.load().context("failed to read the entry store")?;
    info!("Entry store {} holds {} entries", store.path().display(), existing.len());

    let tracker = if config.gnss.enabled {
        match start_gnss(&config.gnss).await {
            Ok(reader) => Some(PositionTracker::spawn(reader)),
            Err(e) => {
                warn!("GNSS unavailable, readings keep only their own positions: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let mut server = IngestionServer::bind(
        &config.server.bind_addr(),
        Arc::clone(&store),
        RateLimiter::new(config.rate_limit.window()),
        ServerSettings::from_config(config),
    )
    .await
    .with_context(|| format!("failed to listen on {}", config.server.bind_addr()))?;

    let mut gnss_task: Option<JoinHandle<()>> = None;
    if let Some((tracker, task)) = tracker {
        server = server.with_position(tracker);
        gnss_task = Some(task);
    }

    info!("Press Ctrl+C to exit");
    server.run().await?;

    if let Some(task) = gnss_task {
        task.abort();
    }
    drain_sync(worker).await;

    Ok(())
}

async fn remove_last(config: &Config) -> Result<()> {
    let (store, worker) = open_store(config);

    let removed = store.remove_last().context("failed to remove the last entry")?;
    match removed {
        Some(entry) => println!("Removed entry from {}", entry.timestamp.to_rfc3339()),
        None => println!("No entries to remove"),
    }

    drain_sync(worker).await;
    Ok(())
}

async fn remove_all(config: &Config) -> Result<()> {
    let (store, worker) = open_store(config);

    let count = store.remove_all().context("failed to clear the entry store")?;
    println!("Removed {} entries", count);

    drain_sync(worker).await;
    Ok(())
}

/// Open the modem and run the start-up sequence
async fn start_gnss(config: &GnssConfig) -> Result<GnssReader<tokio_serial::SerialStream>> {
    let at = AtModem::open_with_paths(
        &modem::candidate_paths(&config.port),
        config.baud_rate,
        Duration::from_millis(config.timeout_ms),
    )?;
    let mut reader = GnssReader::new(at, Duration::from_secs(config.warmup_secs));

    info!("Starting GNSS (warm-up {}s)", config.warmup_secs);
    reader.start().await.context("GNSS start-up failed")?;
    Ok(reader)
}

async fn gnss(config: &GnssConfig) -> Result<()> {
    let mut reader = start_gnss(config).await?;
    info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            fix = reader.next_fix() => match fix {
                Ok(Some(fix)) => {
                    let time = fix.time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
                    println!("{:.6}, {:.6} ({})", fix.latitude, fix.longitude, time);
                }
                Ok(None) => {}
                Err(e) => return Err(e).context("GNSS read failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }
        }
    }
}

async fn send(addr: &str, json: &str) -> Result<()> {
    let answer = send_payload(addr, json.as_bytes(), SEND_TIMEOUT)
        .await
        .with_context(|| format!("failed to send reading to {}", addr))?;
    println!("{}", answer);
    Ok(())
}
