//! Basic Safety Message domain record and J2735 raw-unit decoding.
//!
//! Raw BSM fields carry "unavailable" sentinels from the wire encoding:
//! positions use 0x7FFFFFFF, speed uses 8191 (units of 0.02 m/s), heading
//! uses 28800 (units of 0.0125 degrees) and secMark uses 65535. Decoders
//! map a sentinel to `None` so downstream checks never see one.

use serde::{Deserialize, Serialize};

use crate::geo::Point;

/// Raw latitude/longitude value meaning "unavailable"
pub const POSITION_UNAVAILABLE: f64 = 2_147_483_647.0; // 0x7FFFFFFF

/// Raw speed value meaning "unavailable"
pub const SPEED_UNAVAILABLE: f64 = 8191.0;

/// Raw heading value meaning "unavailable"
pub const HEADING_UNAVAILABLE: f64 = 28800.0;

/// secMark value meaning "unavailable"
pub const SECMARK_UNAVAILABLE: u64 = 65535;

/// One raw speed unit in meters per second
const SPEED_UNIT_MPS: f64 = 0.02;

/// One raw heading unit in degrees
const HEADING_UNIT_DEG: f64 = 0.0125;

/// The redaction-relevant fields extracted from a BSM document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bsm {
    /// Temporary vehicle identifier, 4 bytes
    pub id: [u8; 4],
    /// Tenths of a second within the UTC minute
    pub secmark: Option<u16>,
    pub position: Point,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
}

impl Bsm {
    /// Identifier as uppercase hex, the form used in log lines
    pub fn id_hex(&self) -> String {
        format!(
            "{:02X}{:02X}{:02X}{:02X}",
            self.id[0], self.id[1], self.id[2], self.id[3]
        )
    }

    /// One-line rendering for retain/suppress log messages
    pub fn log_string(&self) -> String {
        format!(
            "id={} lat={:.7} lon={:.7} speed={} heading={}",
            self.id_hex(),
            self.position.lat,
            self.position.lon,
            self.speed_mps
                .map(|v| format!("{:.3}", v))
                .unwrap_or_else(|| "-".to_string()),
            self.heading_deg
                .map(|v| format!("{:.1}", v))
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

/// Validate a temporary id: exactly 8 hex digits after stripping common
/// separators. Returns the decoded bytes, or `None` for anything else.
pub fn validate_id(raw: &str) -> Option<[u8; 4]> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.') && !c.is_whitespace())
        .collect();
    if cleaned.len() != 8 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(&cleaned, 16).ok().map(u32::to_be_bytes)
}

/// Decode a latitude; sentinel and out-of-range values are unavailable
pub fn decode_latitude(raw: f64) -> Option<f64> {
    if raw == POSITION_UNAVAILABLE || !(-90.0..=90.0).contains(&raw) {
        None
    } else {
        Some(raw)
    }
}

/// Decode a longitude; sentinel and out-of-range values are unavailable
pub fn decode_longitude(raw: f64) -> Option<f64> {
    if raw == POSITION_UNAVAILABLE || !(-180.0..=180.0).contains(&raw) {
        None
    } else {
        Some(raw)
    }
}

/// Decode a raw speed (0.02 m/s units) into meters per second
pub fn decode_speed(raw: f64) -> Option<f64> {
    if raw == SPEED_UNAVAILABLE || raw < 0.0 {
        None
    } else {
        Some(raw * SPEED_UNIT_MPS)
    }
}

/// Decode a raw heading (0.0125 degree units) into degrees
pub fn decode_heading(raw: f64) -> Option<f64> {
    if raw == HEADING_UNAVAILABLE || raw < 0.0 {
        None
    } else {
        Some(raw * HEADING_UNIT_DEG)
    }
}

/// Decode a secMark (tenths of a second within the minute)
pub fn decode_secmark(raw: u64) -> Option<u16> {
    if raw == SECMARK_UNAVAILABLE || raw > 59999 {
        None
    } else {
        Some(raw as u16)
    }
}
