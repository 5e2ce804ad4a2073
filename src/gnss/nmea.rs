//! # NMEA Sentence Parsing
//!
//! Extracts a position fix from RMC (Recommended Minimum) sentences.
//!
//! ```text
//! $GNRMC,123519.00,A,4807.038,N,01131.000,E,0.02,,221225,,,A*7C
//!        time      |  lat      |  lon       |          date
//!                status
//! ```

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use tracing::debug;

use super::Fix;

/// Parse an RMC sentence from any talker (`$GNRMC`, `$GPRMC`, ...)
///
/// # Returns
///
/// * `Some(Fix)` - Sentence is a valid RMC with status `A` and non-zero coordinates
/// * `None` - Any other sentence, a void fix, or a malformed line
pub fn parse_rmc(line: &str) -> Option<Fix> {
    let line = line.trim();
    let body = line.strip_prefix('$')?;

    let body = match body.split_once('*') {
        Some((data, checksum)) => {
            if !checksum_matches(data, checksum) {
                debug!("Dropping NMEA sentence with bad checksum: {}", line);
                return None;
            }
            data
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 10 || fields[0].len() != 5 || !fields[0].ends_with("RMC") {
        return None;
    }

    if fields[2] != "A" {
        return None;
    }

    let latitude = parse_coordinate(fields[3], fields[4], 'N', 'S', 90.0)?;
    let longitude = parse_coordinate(fields[5], fields[6], 'E', 'W', 180.0)?;

    if latitude == 0.0 || longitude == 0.0 {
        return None;
    }

    Some(Fix {
        latitude,
        longitude,
        time: parse_datetime(fields[9], fields[1]),
    })
}

/// XOR of every byte between `$` and `*`, compared against the hex suffix
fn checksum_matches(data: &str, checksum: &str) -> bool {
    let expected = match u8::from_str_radix(checksum.trim(), 16) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
    actual == expected
}

/// Convert `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed decimal degrees
fn parse_coordinate(value: &str, hemisphere: &str, positive: char, negative: char, limit: f64) -> Option<f64> {
    if value.is_empty() {
        return None;
    }

    let raw: f64 = value.parse().ok()?;
    if raw < 0.0 {
        return None;
    }

    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    if minutes >= 60.0 {
        return None;
    }

    let decimal = degrees + minutes / 60.0;
    if decimal > limit {
        return None;
    }

    match hemisphere.chars().next()? {
        c if c == positive => Some(decimal),
        c if c == negative => Some(-decimal),
        _ => None,
    }
}

fn parse_datetime(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%d%m%y").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S%.f").ok()?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}
