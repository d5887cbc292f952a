use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Protocol;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Device {
    pub serial: String,
    pub protocol: Protocol,
    pub first_seen_at: DateTime<Utc>,
}

/// One normalized telemetry sample.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Position {
    pub device_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: f64,
    pub direction: u16,
    pub signal: u8,
}

/// Hemisphere-relative coordinate exactly as a device encodes it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawCoordinate {
    /// `ddmm.mmmm` split into its degree and minute parts.
    DegreesMinutes { degrees: u32, minutes: f64, negative: bool },
    /// Unsigned count of 1/30000 minute (GT06).
    ThirtyThousandthsOfMinute { value: u32, negative: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawSpeed {
    Knots(f64),
    Kmh(f64),
}

/// Broken-down UTC time as sent on the wire; not validated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTimestamp {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Protocol-native telemetry fields, before unit conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTelemetry {
    pub timestamp: RawTimestamp,
    pub latitude: RawCoordinate,
    pub longitude: RawCoordinate,
    pub speed: RawSpeed,
    pub course: u16,
    pub valid: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeStats {
    pub total: i64,
    pub stopped: i64,
    pub movement: i64,
    pub total_percent: i64,
    pub stopped_percent: i64,
    pub movement_percent: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct SpeedStats {
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub avg_percent: i64,
    pub max_percent: i64,
    pub min_percent: i64,
    pub avg_movement: f64,
    pub avg_movement_percent: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub time: TimeStats,
    pub speed: SpeedStats,
}

/// A closed trip. Open trips live in [`crate::trip::OpenTrip`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Trip {
    pub id: Uuid,
    pub device_id: String,
    pub start_utc_at: DateTime<Utc>,
    pub end_utc_at: DateTime<Utc>,
    /// meters
    pub distance: u64,
    /// seconds
    pub time: i64,
    pub stats: Stats,
    pub start_address: Option<String>,
    pub end_address: Option<String>,
    pub positions: Vec<Position>,
}

impl Trip {
    pub fn first_position(&self) -> Option<&Position> {
        self.positions.first()
    }

    pub fn last_position(&self) -> Option<&Position> {
        self.positions.last()
    }
}
