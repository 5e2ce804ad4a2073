//! # Wire Protocol
//!
//! One JSON object per TCP connection, answered with a bare status word.
//!
//! ```text
//! client -> {"temp_c": 21.5, "tds": 340, "turbidity_v": 1.2, "ph": 7.4}
//! server <- OK | RATE_LIMITED | ERROR
//! ```
//!
//! There is no length prefix; the payload ends when it forms a complete JSON
//! value, the client closes its side, or the payload limit is reached.

use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{IngestError, Result};
use crate::store::SensorReading;

pub const RESPONSE_OK: &[u8] = b"OK";
pub const RESPONSE_RATE_LIMITED: &[u8] = b"RATE_LIMITED";
pub const RESPONSE_ERROR: &[u8] = b"ERROR";

/// Status answered to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ok,
    RateLimited,
    Error,
}

impl Response {
    /// Bytes sent on the wire
    ///
    /// Rate-limited readings are answered `OK` unless `report_rate_limited`
    /// is set, so existing senders see no protocol change.
    pub fn as_bytes(self, report_rate_limited: bool) -> &'static [u8] {
        match self {
            Response::Ok => RESPONSE_OK,
            Response::RateLimited if report_rate_limited => RESPONSE_RATE_LIMITED,
            Response::RateLimited => RESPONSE_OK,
            Response::Error => RESPONSE_ERROR,
        }
    }
}

/// Decode a payload into a sensor reading
///
/// # Errors
///
/// `Parse` if the bytes are not UTF-8 JSON or not a JSON object. Fields
/// inside the object never cause an error.
pub fn decode_reading(bytes: &[u8]) -> Result<SensorReading> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| IngestError::Parse(e.to_string()))?;

    match value {
        Value::Object(object) => Ok(SensorReading::from_object(&object)),
        other => Err(IngestError::Parse(format!("expected a JSON object, got {}", kind(&other)))),
    }
}

/// True when `bytes` may still become valid JSON with more input
pub fn is_incomplete(bytes: &[u8]) -> bool {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(_) => false,
        Err(e) => e.is_eof(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Send one payload to an ingestion server and return its answer
///
/// Used by the `send` command and by tests.
pub async fn send_payload(addr: &str, payload: &[u8], timeout: Duration) -> Result<String> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, IngestError>(String::from_utf8_lossy(&response).into_owned())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| IngestError::Timeout(format!("no answer from {} within {:?}", addr, timeout)))?
}
