//! # Sync Module
//!
//! Propagates store changes to a durable remote.
//!
//! This module handles:
//! - The [`SyncNotifier`] seam the store reports changes through
//! - A single background worker that delivers notifications in order
//! - Swallowing (and logging) propagation failures so ingestion never stalls
//!
//! The store only ever touches a [`SyncHandle`], whose `notify` is a
//! non-blocking channel send. Slow or unreachable remotes back up the queue,
//! never the document lock.

pub mod git;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

pub use git::GitNotifier;

/// Receives a short description of every successful store mutation
#[async_trait]
pub trait SyncNotifier: Send + Sync {
    async fn notify(&self, change: &str) -> Result<()>;
}

/// Notifier used when replication is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl SyncNotifier for NoopNotifier {
    async fn notify(&self, change: &str) -> Result<()> {
        debug!("Sync disabled, not propagating: {}", change);
        Ok(())
    }
}

#[derive(Debug)]
enum Command {
    Notify(String),
    Shutdown,
}

/// Cheap, cloneable sender side of the sync queue
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl SyncHandle {
    /// A handle that drops every notification
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a change description for delivery
    ///
    /// Never blocks and never fails; a stopped worker is logged.
    pub fn notify(&self, change: &str) {
        let Some(tx) = &self.tx else {
            return;
        };

        if tx.send(Command::Notify(change.to_string())).is_err() {
            warn!("Sync worker stopped, dropping notification: {}", change);
        }
    }
}

/// Background task draining the sync queue
pub struct SyncWorker {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<usize>,
}

impl SyncWorker {
    /// Spawn the worker on the current tokio runtime
    ///
    /// Returns the handle to give to the store alongside the worker itself.
    pub fn spawn(notifier: Arc<dyn SyncNotifier>) -> (SyncHandle, SyncWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(notifier, rx));
        let handle = SyncHandle { tx: Some(tx.clone()) };
        (handle, SyncWorker { tx, task })
    }

    /// Deliver everything queued so far, then stop
    ///
    /// Waits at most `wait`; returns the number of notifications delivered
    /// successfully, or `None` if the deadline passed first.
    pub async fn shutdown(self, wait: Duration) -> Option<usize> {
        let _ = self.tx.send(Command::Shutdown);

        let mut task = self.task;
        match tokio::time::timeout(wait, &mut task).await {
            Ok(Ok(delivered)) => Some(delivered),
            Ok(Err(e)) => {
                warn!("Sync worker panicked: {}", e);
                None
            }
            Err(_) => {
                warn!("Sync queue not drained within {:?}, abandoning pending changes", wait);
                task.abort();
                None
            }
        }
    }
}

async fn run_worker(notifier: Arc<dyn SyncNotifier>, mut rx: mpsc::UnboundedReceiver<Command>) -> usize {
    let mut delivered = 0;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Notify(change) => match notifier.notify(&change).await {
                Ok(()) => {
                    delivered += 1;
                    debug!("Propagated change: {}", change);
                }
                Err(e) => warn!("Failed to propagate '{}': {}", change, e),
            },
            Command::Shutdown => break,
        }
    }

    info!("Sync worker stopped after {} change(s)", delivered);
    delivered
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::error::IngestError;
    use std::sync::Mutex;

    /// Notifier that records every change and can be told to fail
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub changes: Arc<Mutex<Vec<String>>>,
        pub fail: Arc<Mutex<bool>>,
        pub delay: Option<Duration>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get_changes(&self) -> Vec<String> {
            self.changes.lock().unwrap().clone()
        }

        pub fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl SyncNotifier for RecordingNotifier {
        async fn notify(&self, change: &str) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if *self.fail.lock().unwrap() {
                return Err(IngestError::Sync("mock remote unreachable".to_string()));
            }
            self.changes.lock().unwrap().push(change.to_string());
            Ok(())
        }
    }
}
