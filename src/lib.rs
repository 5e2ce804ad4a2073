//! # Aqua Ingest Library
//!
//! Collect water-quality sensor readings over TCP and keep them in a JSON log.
//!
//! This library provides the pieces of the ingestion service:
//! - [`server`]: TCP listener accepting one JSON reading per connection
//! - [`ratelimit`]: fixed-window gate so at most one reading is stored per window
//! - [`store`]: JSON document of entries with atomic saves and corruption recovery
//! - [`sync`]: background replication of every change (git)
//! - [`gnss`]: optional GNSS modem supplying positions for readings

pub mod clock;
pub mod config;
pub mod error;
pub mod gnss;
pub mod logging;
pub mod ratelimit;
pub mod server;
pub mod store;
pub mod sync;

pub use error::{IngestError, Result};
