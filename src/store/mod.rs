//! # Entry Store Module
//!
//! Owns the JSON document on disk.
//!
//! This module handles:
//! - Loading the document, treating a missing, empty or corrupted file as empty
//! - Atomic saves (temp file + rename) retried with exponential backoff
//! - The three mutations: append, remove-last, remove-all
//! - Reporting every successful mutation to the sync queue
//!
//! Every mutation reloads the file, modifies it and saves it again under a
//! single lock, so the file stays the only source of truth. The sync
//! notification is queued after the lock is released.

pub mod entry;
pub mod retry;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{IngestError, Result};
use crate::sync::SyncHandle;

pub use entry::{Document, Entry, SensorReading};
pub use retry::RetryPolicy;

/// Change descriptions handed to the sync queue
pub const CHANGE_APPEND: &str = "Add sensor data entry";
pub const CHANGE_REMOVE_LAST: &str = "Remove last JSON entry";
pub const CHANGE_REMOVE_ALL: &str = "Clear all JSON entries";

/// Raw bytes of a corrupted file included in the log message
const CORRUPT_PREVIEW_BYTES: usize = 256;

/// JSON-backed, append-only entry log
pub struct EntryStore {
    path: PathBuf,
    lock: Mutex<()>,
    retry: RetryPolicy,
    sync: SyncHandle,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("path", &self.path)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl EntryStore {
    /// Create a store backed by `path`
    ///
    /// Nothing touches the disk until the first operation; the file itself
    /// appears with the first successful save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            retry: RetryPolicy::default(),
            sync: SyncHandle::disabled(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sync(mut self, sync: SyncHandle) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document
    ///
    /// A missing or zero-length file is an empty document. A file that is not
    /// valid JSON is logged as corruption and also treated as empty; the next
    /// save overwrites it.
    ///
    /// # Errors
    ///
    /// - `Io` for read failures other than "not found" (e.g. permission denied)
    /// - `Serialize` when the file is valid JSON but not a document (say, a
    ///   top-level array); such a file is never overwritten
    pub fn load(&self) -> Result<Document> {
        match self.load_strict() {
            Ok(doc) => Ok(doc),
            Err(IngestError::StoreCorruption { path, reason }) => {
                warn!("Store {} is corrupted ({}), resetting to an empty document", path, reason);
                Ok(Document::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Load the document, reporting corruption instead of recovering from it
    pub fn load_strict(&self) -> Result<Document> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Store {} does not exist yet", self.path.display());
                return Ok(Document::new());
            }
            Err(e) => {
                error!("Failed to read store {}: {}", self.path.display(), e);
                return Err(e.into());
            }
        };

        if bytes.is_empty() {
            return Ok(Document::new());
        }

        let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
            let preview_len = bytes.len().min(CORRUPT_PREVIEW_BYTES);
            error!(
                path = %self.path.display(),
                at = %self.clock.now().to_rfc3339(),
                size = bytes.len(),
                "Unreadable store content: {:?}",
                String::from_utf8_lossy(&bytes[..preview_len])
            );
            IngestError::StoreCorruption {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        serde_json::from_value(value).map_err(|e| {
            error!(
                path = %self.path.display(),
                "Store holds JSON that is not an entry document, leaving it untouched: {}",
                e
            );
            IngestError::Serialize(e)
        })
    }

    /// Replace the on-disk document with `doc`
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Serialize` once every retry has failed; the previous
    /// file is left untouched in that case.
    pub fn save(&self, doc: &Document) -> Result<()> {
        let _guard = self.lock_document();
        self.save_locked(doc)
    }

    /// Append a new entry built from `reading`, stamped with the current time
    ///
    /// The timestamp never goes backwards relative to the last stored entry,
    /// even if the wall clock does.
    pub fn append(&self, reading: &SensorReading) -> Result<Entry> {
        let entry = {
            let _guard = self.lock_document();
            let mut doc = self.load()?;

            let mut timestamp = self.clock.now();
            if let Some(last) = doc.entries.last() {
                timestamp = timestamp.max(last.timestamp);
            }

            let entry = Entry::from_reading(reading, timestamp);
            doc.entries.push(entry.clone());
            self.save_locked(&doc)?;
            entry
        };

        info!("Stored entry at {}", entry.timestamp.to_rfc3339());
        self.sync.notify(CHANGE_APPEND);
        Ok(entry)
    }

    /// Remove and return the most recent entry, if any
    pub fn remove_last(&self) -> Result<Option<Entry>> {
        let removed = {
            let _guard = self.lock_document();
            let mut doc = self.load()?;

            let Some(removed) = doc.entries.pop() else {
                info!("No entries to remove");
                return Ok(None);
            };

            self.save_locked(&doc)?;
            removed
        };

        info!("Removed entry from {}", removed.timestamp.to_rfc3339());
        self.sync.notify(CHANGE_REMOVE_LAST);
        Ok(Some(removed))
    }

    /// Remove every entry, returning how many there were
    pub fn remove_all(&self) -> Result<usize> {
        let count = {
            let _guard = self.lock_document();
            let mut doc = self.load()?;
            let count = doc.entries.len();
            doc.entries.clear();
            self.save_locked(&doc)?;
            count
        };

        info!("All entries removed ({})", count);
        self.sync.notify(CHANGE_REMOVE_ALL);
        Ok(count)
    }

    fn lock_document(&self) -> MutexGuard<'_, ()> {
        // The guarded state lives on disk; a panic mid-mutation leaves the
        // file either old or new, so a poisoned lock is still usable.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save_locked(&self, doc: &Document) -> Result<()> {
        let contents = serde_json::to_vec_pretty(doc)?;

        self.retry
            .run("Store save", || self.write_atomic(&contents))
            .map_err(|e| {
                error!(
                    path = %self.path.display(),
                    at = %self.clock.now().to_rfc3339(),
                    entries = doc.entries.len(),
                    "Failed to save store: {}",
                    e
                );
                e
            })
    }

    fn write_atomic(&self, contents: &[u8]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".entries-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(contents)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| IngestError::Io(e.error))?;

        if let Ok(dir_file) = fs::File::open(dir) {
            let _ = dir_file.sync_all();
        }

        debug!("Saved store {} ({} bytes)", self.path.display(), contents.len());
        Ok(())
    }
}
