//! # AT Command Modem
//!
//! Line-oriented request/response over a serial stream.
//!
//! Commands are written as `COMMAND\r\n`. The modem echoes the command back
//! before answering, so the echo (and blank lines) are skipped and the first
//! remaining line is the response.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};

/// Device paths tried when none is configured (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyS0",   // Raspberry Pi UART wired to the HAT
    "/dev/ttyUSB2", // SIMCom modules over USB expose AT on the third port
];

/// Device paths to try for a configured `port`
///
/// An empty `port` means auto-detect over [`DEFAULT_DEVICE_PATHS`].
pub fn candidate_paths(port: &str) -> Vec<&str> {
    if port.is_empty() {
        DEFAULT_DEVICE_PATHS.to_vec()
    } else {
        vec![port]
    }
}

/// AT command channel over any async byte stream
pub struct AtModem<S> {
    stream: BufReader<S>,
    timeout: Duration,
    device_path: String,
}

impl<S> std::fmt::Debug for AtModem<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtModem")
            .field("device_path", &self.device_path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AtModem<SerialStream> {
    /// Open the first serial device in `paths` that can be opened
    ///
    /// # Errors
    ///
    /// `SerialPortNotFound` listing every path tried
    pub fn open_with_paths(paths: &[&str], baud_rate: u32, timeout: Duration) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened GNSS modem at {} ({} baud)", path, baud_rate);
                    return Ok(Self::new(port, timeout, path));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(IngestError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port, 8N1 without flow control
    fn open_port(path: &str, baud_rate: u32) -> Result<SerialStream> {
        tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| IngestError::Serial(format!("Failed to open {}: {}", path, e)))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AtModem<S> {
    /// Wrap an already-open stream
    ///
    /// `timeout` bounds every single line read.
    pub fn new(stream: S, timeout: Duration, device_path: &str) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout,
            device_path: device_path.to_string(),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Send a command and return its response line
    ///
    /// # Errors
    ///
    /// - `Serial` if the write fails or the port closes
    /// - `Gnss` if no response arrives within the timeout
    pub async fn send_command(&mut self, command: &str) -> Result<String> {
        self.write_command(command).await?;

        loop {
            let Some(line) = self.read_line().await? else {
                return Err(IngestError::Gnss(format!("no response to {}", command)));
            };

            if line.is_empty() || line == command {
                continue;
            }

            debug!("{} -> {}", command, line);
            return Ok(line);
        }
    }

    /// Send a command without waiting for an answer
    pub async fn send_command_no_reply(&mut self, command: &str) -> Result<()> {
        self.write_command(command).await
    }

    /// Read one line, trimmed of surrounding whitespace
    ///
    /// Returns `Ok(None)` when nothing arrives within the timeout.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();

        match tokio::time::timeout(self.timeout, self.stream.read_until(b'\n', &mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(IngestError::Serial(format!("{} closed", self.device_path))),
            Ok(Ok(_)) => Ok(Some(String::from_utf8_lossy(&buf).trim().to_string())),
            Ok(Err(e)) => Err(IngestError::Serial(format!("Failed to read from {}: {}", self.device_path, e))),
        }
    }

    async fn write_command(&mut self, command: &str) -> Result<()> {
        let port = self.stream.get_mut();
        let mut frame = Vec::with_capacity(command.len() + 2);
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(b"\r\n");

        port.write_all(&frame)
            .await
            .map_err(|e| IngestError::Serial(format!("Failed to write {}: {}", command, e)))?;
        port.flush()
            .await
            .map_err(|e| IngestError::Serial(format!("Failed to flush serial port: {}", e)))?;

        debug!("Sent command: {}", command);
        Ok(())
    }
}
