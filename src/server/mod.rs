//! # Ingestion Server Module
//!
//! Accepts sensor readings over TCP and persists them.
//!
//! This module handles:
//! - Accepting connections (concurrently, up to a configured limit)
//! - Reading exactly one JSON reading per connection, with a timeout
//! - Gating readings through the [`RateLimiter`]
//! - Appending accepted readings to the [`EntryStore`]
//! - Answering `OK` / `ERROR` and closing the connection
//!
//! ## Connection flow
//!
//! ```text
//! accept -> read (bounded) -> decode -> rate limit -> append -> respond
//!              |                |           |
//!         empty: close     bad: ERROR   rejected: OK (dropped)
//! ```
//!
//! A failure while handling one connection is logged and answered with
//! `ERROR`; it never reaches the accept loop.

pub mod protocol;

use bytes::{BufMut, BytesMut};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::gnss::PositionTracker;
use crate::ratelimit::RateLimiter;
use crate::store::{Entry, EntryStore, SensorReading};

pub use protocol::{decode_reading, send_payload, Response};

/// Pause after a failed `accept` (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for in-flight connections
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection limits and protocol options
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_payload_bytes: usize,
    pub max_connections: usize,
    pub report_rate_limited: bool,
    pub max_fix_age: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_timeout: config.server.read_timeout(),
            write_timeout: config.store.write_timeout(),
            max_payload_bytes: config.server.max_payload_bytes,
            max_connections: config.server.max_connections,
            report_rate_limited: config.server.report_rate_limited,
            max_fix_age: Duration::from_secs(config.gnss.max_fix_age_secs),
        }
    }
}

/// What happened to one connection
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing was received; closed without a response
    Empty,
    Stored(Entry),
    RateLimited,
    Rejected(String),
}

/// Counters reported at shutdown
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections: AtomicU64,
    pub stored: AtomicU64,
    pub rate_limited: AtomicU64,
    pub errors: AtomicU64,
}

impl ServerStats {
    fn record(&self, outcome: &Outcome) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Empty => return,
            Outcome::Stored(_) => &self.stored,
            Outcome::RateLimited => &self.rate_limited,
            Outcome::Rejected(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct ServerState {
    store: Arc<EntryStore>,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    position: Option<PositionTracker>,
    settings: ServerSettings,
    stats: ServerStats,
}

/// TCP ingestion server
pub struct IngestionServer {
    listener: TcpListener,
    state: ServerState,
}

impl IngestionServer {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// `Io` if the address is invalid or already in use
    pub async fn bind(addr: &str, store: Arc<EntryStore>, limiter: RateLimiter, settings: ServerSettings) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state: ServerState {
                store,
                limiter,
                clock: Arc::new(SystemClock),
                position: None,
                settings,
                stats: ServerStats::default(),
            },
        })
    }

    /// Use `clock` for rate limiting decisions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.state.clock = clock;
        self
    }

    /// Attach GNSS positions to readings that carry none
    pub fn with_position(mut self, tracker: PositionTracker) -> Self {
        self.state.position = Some(tracker);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl+C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await
    }

    /// Serve until `shutdown` completes
    ///
    /// On shutdown the listener is closed first, then in-flight connections
    /// get up to ten seconds to finish so their writes land on disk.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) -> Result<()> {
        let IngestionServer { listener, state } = self;
        let state = Arc::new(state);
        let permits = Arc::new(Semaphore::new(state.settings.max_connections));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            let _permit = permit;
                            handle_connection(&state, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight connection(s)", tasks.len());
        }
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Abandoning {} connection(s) still open after {:?}", tasks.len(), DRAIN_TIMEOUT);
        }

        let stats = &state.stats;
        info!(
            "Server stopped: {} connection(s), {} stored, {} rate limited, {} error(s)",
            stats.connections.load(Ordering::Relaxed),
            stats.stored.load(Ordering::Relaxed),
            stats.rate_limited.load(Ordering::Relaxed),
            stats.errors.load(Ordering::Relaxed),
        );
        Ok(())
    }
}

async fn handle_connection(state: &ServerState, mut stream: TcpStream, peer: SocketAddr) {
    debug!("Connected by {}", peer);

    let outcome = process(state, &mut stream).await;
    state.stats.record(&outcome);

    let response = match &outcome {
        Outcome::Empty => {
            debug!("Empty connection from {}", peer);
            return;
        }
        Outcome::Stored(entry) => {
            info!("Stored reading from {} at {}", peer, entry.timestamp.to_rfc3339());
            Response::Ok
        }
        Outcome::RateLimited => {
            info!("Skipped reading from {}: rate limited", peer);
            Response::RateLimited
        }
        Outcome::Rejected(reason) => {
            warn!("Rejected connection from {}: {}", peer, reason);
            Response::Error
        }
    };

    let bytes = response.as_bytes(state.settings.report_rate_limited);
    let reply = async {
        stream.write_all(bytes).await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(state.settings.write_timeout, reply).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to answer {}: {}", peer, e),
        Err(_) => debug!("Timed out answering {}", peer),
    }
}

async fn process(state: &ServerState, stream: &mut TcpStream) -> Outcome {
    let payload = match read_payload(stream, state.settings.max_payload_bytes, state.settings.read_timeout).await {
        Ok(payload) if payload.is_empty() => return Outcome::Empty,
        Ok(payload) => payload,
        Err(e) => return Outcome::Rejected(e.to_string()),
    };

    let mut reading = match decode_reading(&payload) {
        Ok(reading) => reading,
        Err(e) => {
            return Outcome::Rejected(format!(
                "{} (payload: {:?})",
                e,
                String::from_utf8_lossy(&payload)
            ))
        }
    };

    if !state.limiter.try_accept_now(state.clock.as_ref()) {
        return Outcome::RateLimited;
    }

    attach_position(state, &mut reading);

    match append(state, reading).await {
        Ok(entry) => Outcome::Stored(entry),
        Err(e) => Outcome::Rejected(e.to_string()),
    }
}

fn attach_position(state: &ServerState, reading: &mut SensorReading) {
    if reading.has_position() {
        return;
    }
    if let Some(fix) = state.position.as_ref().and_then(|p| p.latest(state.settings.max_fix_age)) {
        reading.lat = Some(fix.latitude);
        reading.lon = Some(fix.longitude);
    }
}

/// Run the blocking append off the async workers, bounded by the write timeout
///
/// A timed-out append keeps running to completion in the background; the
/// document lock keeps later mutations behind it.
async fn append(state: &ServerState, reading: SensorReading) -> Result<Entry> {
    let store = Arc::clone(&state.store);
    let task = tokio::task::spawn_blocking(move || store.append(&reading));

    match tokio::time::timeout(state.settings.write_timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(IngestError::Io(std::io::Error::other(format!("append task failed: {}", e)))),
        Err(_) => Err(IngestError::Timeout(format!("append after {:?}", state.settings.write_timeout))),
    }
}

/// Read until the payload is a complete JSON value, the peer closes its
/// side, the size limit is hit, or the read timeout expires
async fn read_payload(stream: &mut TcpStream, max_bytes: usize, timeout: Duration) -> Result<BytesMut> {
    let deadline = Instant::now() + timeout;
    let mut buf = BytesMut::with_capacity(max_bytes);

    loop {
        let remaining = max_bytes - buf.len();
        let read = tokio::time::timeout_at(deadline, stream.read_buf(&mut (&mut buf).limit(remaining))).await;

        match read {
            Err(_) if buf.is_empty() => {
                debug!("Read timed out with no data");
                return Ok(buf);
            }
            Err(_) => return Ok(buf),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(0)) => return Ok(buf),
            Ok(Ok(_)) => {}
        }

        if buf.len() >= max_bytes || !protocol::is_incomplete(&buf) {
            return Ok(buf);
        }
    }
}
