//! # GNSS Module
//!
//! Reads position fixes from a SIMCom-style GNSS modem over AT commands.
//!
//! This module handles:
//! - Opening the modem's serial port
//! - Powering the GNSS engine and routing NMEA output to the AT port
//! - Parsing RMC sentences into position fixes
//! - Tracking the latest fix for the ingestion server
//!
//! ## Start-up sequence
//!
//! | Step | Command | Expected |
//! |------|---------|----------|
//! | reset | `AT+CGNSSPORTSWITCH=0,0`, `AT+CGNSSTST=0`, `AT+CGNSSPWR=0` | ignored |
//! | probe | `AT` | `OK` |
//! | power on | `AT+CGNSSPWR=1` | `OK` |
//! | NMEA output | `AT+CGNSSTST=1` | `OK` |
//! | route NMEA to AT port | `AT+CGNSSPORTSWITCH=0,1` (after warm-up) | no reply |

pub mod modem;
pub mod nmea;
pub mod tracker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::error::{IngestError, Result};

pub use modem::AtModem;
pub use tracker::PositionTracker;

/// A position fix in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// UTC time reported by the receiver, when the sentence carried one
    pub time: Option<DateTime<Utc>>,
}

/// Producer of position fixes
#[async_trait]
pub trait PositionSource: Send {
    /// Wait for the next line of output
    ///
    /// Returns `Ok(None)` when that line held no usable fix.
    ///
    /// # Errors
    ///
    /// Transport failures (`Serial`)
    async fn next_fix(&mut self) -> Result<Option<Fix>>;
}

/// GNSS receiver driven through an [`AtModem`]
#[derive(Debug)]
pub struct GnssReader<S> {
    modem: AtModem<S>,
    warmup: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> GnssReader<S> {
    pub fn new(modem: AtModem<S>, warmup: Duration) -> Self {
        Self { modem, warmup }
    }

    /// Run the full start-up sequence
    pub async fn start(&mut self) -> Result<()> {
        self.reset().await;
        self.probe().await?;
        self.power_on().await?;
        self.enable_output().await?;
        self.route_output().await?;
        info!("GNSS output enabled on {}", self.modem.device_path());
        Ok(())
    }

    /// Put the engine into a known state; failures are only logged
    pub async fn reset(&mut self) {
        for command in ["AT+CGNSSPORTSWITCH=0,0", "AT+CGNSSTST=0", "AT+CGNSSPWR=0"] {
            if let Err(e) = self.modem.send_command(command).await {
                warn!("GNSS reset step {} failed: {}", command, e);
            }
        }
    }

    /// Check the modem answers at all
    pub async fn probe(&mut self) -> Result<()> {
        self.expect_ok("AT").await
    }

    pub async fn power_on(&mut self) -> Result<()> {
        self.expect_ok("AT+CGNSSPWR=1").await
    }

    pub async fn enable_output(&mut self) -> Result<()> {
        self.expect_ok("AT+CGNSSTST=1").await
    }

    /// Wait for the engine to warm up, then route NMEA to this port
    pub async fn route_output(&mut self) -> Result<()> {
        tokio::time::sleep(self.warmup).await;
        self.modem.send_command_no_reply("AT+CGNSSPORTSWITCH=0,1").await
    }

    async fn expect_ok(&mut self, command: &str) -> Result<()> {
        let response = self.modem.send_command(command).await?;
        if response != "OK" {
            return Err(IngestError::Gnss(format!("{} answered {}", command, response)));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> PositionSource for GnssReader<S> {
    async fn next_fix(&mut self) -> Result<Option<Fix>> {
        Ok(self.modem.read_line().await?.as_deref().and_then(nmea::parse_rmc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn reader(mock: tokio_test::io::Mock) -> GnssReader<tokio_test::io::Mock> {
        GnssReader::new(AtModem::new(mock, Duration::from_millis(200), "mock"), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_start_sequence() {
        let mock = Builder::new()
            .write(b"AT+CGNSSPORTSWITCH=0,0\r\n")
            .read(b"AT+CGNSSPORTSWITCH=0,0\r\nOK\r\n")
            .write(b"AT+CGNSSTST=0\r\n")
            .read(b"OK\r\n")
            .write(b"AT+CGNSSPWR=0\r\n")
            .read(b"OK\r\n")
            .write(b"AT\r\n")
            .read(b"AT\r\nOK\r\n")
            .write(b"AT+CGNSSPWR=1\r\n")
            .read(b"OK\r\n")
            .write(b"AT+CGNSSTST=1\r\n")
            .read(b"OK\r\n")
            .write(b"AT+CGNSSPORTSWITCH=0,1\r\n")
            .build();

        reader(mock).start().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_rejects_non_ok() {
        let mock = Builder::new().write(b"AT\r\n").read(b"ERROR\r\n").build();
        assert!(matches!(reader(mock).probe().await, Err(IngestError::Gnss(_))));
    }

    #[tokio::test]
    async fn test_next_fix() {
        let mock = Builder::new()
            .read(b"$GNGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,\r\n")
            .read(b"$GNRMC,101010,A,4200.000,N,08000.000,W,,,221225,,\r\n")
            .build();
        let mut reader = reader(mock);

        assert_eq!(reader.next_fix().await.unwrap(), None);
        let fix = reader.next_fix().await.unwrap().unwrap();
        assert!((fix.latitude - 42.0).abs() < 1e-9);
        assert!((fix.longitude + 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_next_fix_silence_is_none() {
        let mock = Builder::new().wait(Duration::from_secs(5)).build();
        let mut reader = GnssReader::new(AtModem::new(mock, Duration::from_millis(20), "mock"), Duration::ZERO);

        assert_eq!(reader.next_fix().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_fix_closed_port() {
        let mock = Builder::new().build();
        assert!(matches!(reader(mock).next_fix().await, Err(IngestError::Serial(_))));
    }
}
