//! # Entry Types
//!
//! The persisted document, its entries, and the sensor reading that an
//! append is built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// One sensor reading as received from the measurement device
///
/// Every field is optional; absent or non-numeric values decode as `None`.
/// Measurements keep the number exactly as sent, so `340` stays an integer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub temp_c: Option<Number>,
    pub tds: Option<Number>,
    pub turbidity_v: Option<Number>,
    pub ph: Option<Number>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Interpret a JSON value as a measurement
///
/// Numbers are taken as they are; strings holding a number (`"21.5"`) are
/// parsed. Anything else is absent.
pub fn measurement(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => serde_json::from_str::<Number>(s.trim()).ok(),
        _ => None,
    }
}

/// Interpret a JSON value as a coordinate in decimal degrees
pub fn coordinate(value: &Value) -> Option<f64> {
    measurement(value).and_then(|n| n.as_f64())
}

impl SensorReading {
    /// Build a reading from a decoded JSON object
    ///
    /// Only numeric values are taken; a field holding a bool, a nested value
    /// or a non-numeric string is treated as missing rather than rejecting
    /// the reading.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let number = |key: &str| object.get(key).and_then(measurement);
        let degrees = |key: &str| object.get(key).and_then(coordinate);

        Self {
            temp_c: number("temp_c"),
            tds: number("tds"),
            turbidity_v: number("turbidity_v"),
            ph: number("ph"),
            lat: degrees("lat"),
            lon: degrees("lon"),
        }
    }

    /// True when the reading carries a position
    pub fn has_position(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }
}

/// One persisted sensor observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Assigned by the store at append time
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, deserialize_with = "lenient::measurement")]
    pub temperature_c: Option<Number>,

    #[serde(default, deserialize_with = "lenient::measurement")]
    pub tds_ppm: Option<Number>,

    #[serde(default, deserialize_with = "lenient::measurement")]
    pub turbidity_v: Option<Number>,

    #[serde(default, deserialize_with = "lenient::measurement")]
    pub ph: Option<Number>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::coordinate")]
    pub lat: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::coordinate")]
    pub lon: Option<f64>,

    /// Fields written by other tools, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entry {
    /// Create an entry stamped with `timestamp` from a sensor reading
    pub fn from_reading(reading: &SensorReading, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            temperature_c: reading.temp_c.clone(),
            tds_ppm: reading.tds.clone(),
            turbidity_v: reading.turbidity_v.clone(),
            ph: reading.ph.clone(),
            lat: reading.lat,
            lon: reading.lon,
            extra: Map::new(),
        }
    }
}

/// The whole persisted state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub entries: Vec<Entry>,

    /// Top-level keys written by other tools, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Field deserializers that never fail on a value of the wrong type
///
/// Hand-edited or older documents may hold strings or other values where a
/// number is expected; those load as absent instead of failing the whole
/// document.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::{Number, Value};

    pub fn measurement<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Number>, D::Error> {
        Ok(super::measurement(&Value::deserialize(deserializer)?))
    }

    pub fn coordinate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Ok(super::coordinate(&Value::deserialize(deserializer)?))
    }
}

/// Timestamp (de)serialization
///
/// Writes RFC 3339 in UTC with a `Z` suffix. Reads RFC 3339 with any offset,
/// and also naive ISO-8601 (`2025-12-22T10:00:00.123456`), which is taken
/// as UTC.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(parsed.with_timezone(&Utc));
        }

        NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|e| format!("invalid timestamp {:?}: {}", raw, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn float(v: f64) -> Option<Number> {
        Number::from_f64(v)
    }

    #[test]
    fn test_reading_from_object_all_fields() {
        let value = json!({"temp_c": 21.5, "tds": 340, "turbidity_v": 1.2, "ph": 7.4});
        let reading = SensorReading::from_object(value.as_object().unwrap());

        assert_eq!(reading.temp_c, float(21.5));
        assert_eq!(reading.tds, Some(Number::from(340)));
        assert_eq!(reading.turbidity_v, float(1.2));
        assert_eq!(reading.ph, float(7.4));
        assert!(!reading.has_position());
    }

    #[test]
    fn test_reading_ignores_non_numeric_fields() {
        let value = json!({"temp_c": "warm", "tds": null, "ph": [7], "turbidity_v": true, "lat": 42.1, "lon": -81.2});
        let reading = SensorReading::from_object(value.as_object().unwrap());

        assert_eq!(reading.temp_c, None);
        assert_eq!(reading.tds, None);
        assert_eq!(reading.ph, None);
        assert_eq!(reading.turbidity_v, None);
        assert!(reading.has_position());
    }

    #[test]
    fn test_reading_accepts_numeric_strings() {
        let value = json!({"temp_c": "21.5", "tds": " 340 ", "lat": "42.25", "lon": "-81.5"});
        let reading = SensorReading::from_object(value.as_object().unwrap());

        assert_eq!(reading.temp_c, float(21.5));
        assert_eq!(reading.tds, Some(Number::from(340)));
        assert_eq!(reading.lat, Some(42.25));
        assert_eq!(reading.lon, Some(-81.5));
    }

    #[test]
    fn test_entry_serializes_missing_fields_as_null() {
        let ts = Utc.with_ymd_and_hms(2025, 12, 22, 10, 0, 0).unwrap();
        let reading = SensorReading { temp_c: float(21.5), tds: Some(340.into()), ..Default::default() };
        let entry = Entry::from_reading(&reading, ts);

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["timestamp"], "2025-12-22T10:00:00Z");
        assert_eq!(value["temperature_c"], 21.5);
        assert!(value["tds_ppm"].is_u64());
        assert_eq!(value["tds_ppm"], 340);
        assert!(value["turbidity_v"].is_null());
        assert!(value["ph"].is_null());
        assert!(value.get("turbidity_v").is_some());
        assert!(value.get("lat").is_none());
        assert!(value.get("lon").is_none());
    }

    #[test]
    fn test_entry_accepts_naive_timestamp() {
        let raw = r#"{"timestamp": "2025-12-22T10:00:00.123456", "temperature_c": 5.0,
                      "tds_ppm": null, "turbidity_v": null, "ph": null}"#;
        let entry: Entry = serde_json::from_str(raw).unwrap();

        let expected = Utc.with_ymd_and_hms(2025, 12, 22, 10, 0, 0).unwrap()
            + chrono::Duration::microseconds(123456);
        assert_eq!(entry.timestamp, expected);
    }

    #[test]
    fn test_entry_accepts_offset_timestamp() {
        let parsed = timestamp::parse("2025-12-22T12:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 12, 22, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_entry_rejects_garbage_timestamp() {
        assert!(timestamp::parse("yesterday").is_err());
    }

    #[test]
    fn test_entry_keeps_unknown_fields() {
        let raw = r#"{"timestamp": "2025-12-22T00:00:00Z", "temperature_c": 12.3,
                      "tds": 512, "turbidity_v": 2.5, "ph": 8.1,
                      "lat": 42.5, "lon": -80.1}"#;
        let entry: Entry = serde_json::from_str(raw).unwrap();

        assert_eq!(entry.tds_ppm, None);
        assert_eq!(entry.lat, Some(42.5));
        assert_eq!(entry.extra.get("tds"), Some(&json!(512)));

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["tds"], 512);
    }

    #[test]
    fn test_entry_nanosecond_timestamp_survives() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::nanoseconds(7);
        let entry = Entry::from_reading(&SensorReading::default(), ts);

        let text = serde_json::to_string(&entry).unwrap();
        let back: Entry = serde_json::from_str(&text).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_document_missing_entries_key() {
        let doc: Document = serde_json::from_str("{}").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_entry_with_mistyped_fields_still_loads() {
        let raw = r#"{"timestamp": "2025-12-22T10:00:00.5", "temperature_c": "21.5",
                      "tds_ppm": "high", "turbidity_v": [1.2], "ph": {"value": 7},
                      "lat": "n/a", "lon": -80.1}"#;
        let entry: Entry = serde_json::from_str(raw).unwrap();

        assert_eq!(entry.temperature_c, float(21.5));
        assert_eq!(entry.tds_ppm, None);
        assert_eq!(entry.turbidity_v, None);
        assert_eq!(entry.ph, None);
        assert_eq!(entry.lat, None);
        assert_eq!(entry.lon, Some(-80.1));
    }

    #[test]
    fn test_document_keeps_unknown_top_level_keys() {
        let raw = r#"{"entries": [], "station": "north-dock", "version": 2}"#;
        let doc: Document = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.extra.get("station"), Some(&json!("north-dock")));

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value, json!({"entries": [], "station": "north-dock", "version": 2}));
    }
}
