//! Trip distance, time and speed summaries.
//!
//! [`Accumulator`] folds one inter-sample interval at a time. The segmenter
//! keeps one running for the open trip; [`finalize`] always rebuilds a fresh
//! one from the position list so the result depends on nothing but the
//! positions and the settings.

use crate::config::{Precision, TripSettings};
use crate::normalize::round_to;
use crate::types::{Position, SpeedStats, Stats, TimeStats};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance in meters.
pub fn distance_m(a: &Position, b: &Position) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Accumulator {
    distance: f64,
    total: i64,
    stopped: i64,
    movement: i64,
    max_speed: f64,
    min_speed: Option<f64>,
    samples: usize,
}

/// What [`finalize`] produces for a closed trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripSummary {
    /// meters
    pub distance: u64,
    /// seconds
    pub time: i64,
    pub stats: Stats,
}

impl Accumulator {
    pub fn start(first: &Position) -> Self {
        let mut acc = Accumulator::default();
        acc.sample(first.speed);
        acc
    }

    fn sample(&mut self, speed: f64) {
        self.samples += 1;
        self.max_speed = self.max_speed.max(speed);
        self.min_speed = Some(self.min_speed.map_or(speed, |min| min.min(speed)));
    }

    /// Account for the interval `[prev, next]` and the sample `next`.
    pub fn fold(&mut self, prev: &Position, next: &Position, movement_epsilon_kmh: f64) {
        let seconds = (next.timestamp - prev.timestamp).num_seconds().max(0);
        self.total += seconds;
        if prev.speed > movement_epsilon_kmh || next.speed > movement_epsilon_kmh {
            self.movement += seconds;
        } else {
            self.stopped += seconds;
        }
        self.distance += distance_m(prev, next);
        self.sample(next.speed);
    }

    pub fn distance_m(&self) -> f64 {
        self.distance
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn summary(&self, precision: &Precision) -> TripSummary {
        let decimals = precision.speed_decimals;
        let distance = self.distance.round() as u64;

        let time = TimeStats {
            total: self.total,
            stopped: self.stopped,
            movement: self.movement,
            total_percent: 100,
            stopped_percent: percent(self.stopped as f64, self.total as f64),
            movement_percent: percent(self.movement as f64, self.total as f64),
        };

        let max = round_to(self.max_speed, decimals);
        let min = round_to(self.min_speed.unwrap_or(0.0), decimals);
        let avg = round_to(kmh(distance, self.total), decimals);
        let avg_movement = round_to(kmh(distance, self.movement), decimals);

        // avg is derived from distance and can leave [min, max] after a
        // position jump; percentages stay within [min_percent, 100].
        let max_percent = percent(max, max);
        let min_percent = percent(min, max);
        let speed = SpeedStats {
            avg,
            max,
            min,
            avg_percent: percent(avg, max).clamp(min_percent, max_percent),
            max_percent,
            min_percent,
            avg_movement,
            avg_movement_percent: percent(avg_movement, max).min(max_percent),
        };

        TripSummary {
            distance,
            time: self.total,
            stats: Stats { time, speed },
        }
    }
}

/// Average speed in km/h over `seconds`; 0 for an empty span.
fn kmh(distance_m: u64, seconds: i64) -> f64 {
    if seconds <= 0 {
        return 0.0;
    }
    distance_m as f64 / seconds as f64 * 3.6
}

/// `part / whole * 100` rounded; 0 when `whole` is 0.
fn percent(part: f64, whole: f64) -> i64 {
    if whole <= 0.0 {
        return 0;
    }
    (part / whole * 100.0).round() as i64
}

/// Summarize an ordered, non-empty position list.
pub fn finalize(positions: &[Position], settings: &TripSettings, precision: &Precision) -> TripSummary {
    let Some(first) = positions.first() else {
        return Accumulator::default().summary(precision);
    };
    let mut acc = Accumulator::start(first);
    for pair in positions.windows(2) {
        acc.fold(&pair[0], &pair[1], settings.movement_epsilon_kmh);
    }
    acc.summary(precision)
}
