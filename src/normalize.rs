//! Raw telemetry to canonical [`Position`].

use chrono::{NaiveDate, TimeZone, Utc};

use crate::config::Precision;
use crate::error::Rejection;
use crate::types::{Position, RawCoordinate, RawSpeed, RawTelemetry, RawTimestamp};

const KNOTS_TO_KMH: f64 = 1.852;

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

pub fn coordinate_degrees(raw: RawCoordinate) -> f64 {
    let (magnitude, negative) = match raw {
        RawCoordinate::DegreesMinutes {
            degrees,
            minutes,
            negative,
        } => (degrees as f64 + minutes / 60.0, negative),
        RawCoordinate::ThirtyThousandthsOfMinute { value, negative } => {
            (value as f64 / 30_000.0 / 60.0, negative)
        }
    };
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

pub fn speed_kmh(raw: RawSpeed) -> f64 {
    match raw {
        RawSpeed::Knots(knots) => knots * KNOTS_TO_KMH,
        RawSpeed::Kmh(kmh) => kmh,
    }
}

fn timestamp(raw: RawTimestamp) -> Result<chrono::DateTime<Utc>, Rejection> {
    let naive = NaiveDate::from_ymd_opt(raw.year, raw.month, raw.day)
        .and_then(|date| date.and_hms_opt(raw.hour, raw.minute, raw.second))
        .ok_or(Rejection::InvalidTimestamp)?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, Rejection> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Rejection::OutOfRange { field, value })
    }
}

/// Convert units, validate ranges and enforce per-device time ordering
/// against the last accepted position. Pure: the caller owns `last`.
pub fn normalize(
    device_id: &str,
    raw: &RawTelemetry,
    last: Option<&Position>,
    precision: &Precision,
) -> Result<Position, Rejection> {
    let timestamp = timestamp(raw.timestamp)?;

    let latitude = in_range("latitude", coordinate_degrees(raw.latitude), -90.0, 90.0)?;
    let longitude = in_range("longitude", coordinate_degrees(raw.longitude), -180.0, 180.0)?;
    let speed = in_range("speed", speed_kmh(raw.speed), 0.0, f64::MAX)?;

    if let Some(last) = last {
        if timestamp == last.timestamp {
            return Err(Rejection::Duplicate);
        }
        if timestamp < last.timestamp {
            return Err(Rejection::OutOfOrder);
        }
    }

    Ok(Position {
        device_id: device_id.to_string(),
        sequence: last.map_or(1, |p| p.sequence + 1),
        timestamp,
        latitude: round_to(latitude, precision.coordinate_decimals),
        longitude: round_to(longitude, precision.coordinate_decimals),
        speed: round_to(speed, precision.speed_decimals),
        direction: raw.course % 360,
        signal: u8::from(raw.valid),
    })
}
