//! Trip segmentation.
//!
//! Two states: no trip, or one open trip accumulating positions. A sample
//! arriving more than `max_gap_secs` after the previous one closes the open
//! trip and starts a new one with that sample. Stops shorter than the gap
//! stay inside the trip and only count as stopped time.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::{Precision, TripSettings};
use crate::stats::{self, Accumulator, TripSummary};
use crate::types::{Position, Trip};

/// A trip still receiving positions.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTrip {
    pub id: Uuid,
    pub device_id: String,
    pub start_utc_at: DateTime<Utc>,
    pub end_utc_at: DateTime<Utc>,
    positions: Vec<Position>,
    running: Accumulator,
}

impl OpenTrip {
    fn start(first: Position) -> Self {
        OpenTrip {
            id: Uuid::new_v4(),
            device_id: first.device_id.clone(),
            start_utc_at: first.timestamp,
            end_utc_at: first.timestamp,
            running: Accumulator::start(&first),
            positions: vec![first],
        }
    }

    fn extend(&mut self, next: Position, settings: &TripSettings) {
        if let Some(prev) = self.positions.last() {
            self.running.fold(prev, &next, settings.movement_epsilon_kmh);
        }
        self.end_utc_at = next.timestamp;
        self.positions.push(next);
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn last_position(&self) -> Option<&Position> {
        self.positions.last()
    }

    /// Figures so far, without closing the trip.
    pub fn running(&self, precision: &Precision) -> TripSummary {
        self.running.summary(precision)
    }

    fn close(self, settings: &TripSettings, precision: &Precision) -> Trip {
        let summary = stats::finalize(&self.positions, settings, precision);
        Trip {
            id: self.id,
            device_id: self.device_id,
            start_utc_at: self.start_utc_at,
            end_utc_at: self.end_utc_at,
            distance: summary.distance,
            time: summary.time,
            stats: summary.stats,
            start_address: None,
            end_address: None,
            positions: self.positions,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    NoTrip,
    Open(OpenTrip),
}

#[derive(Debug, Clone)]
pub struct TripSegmenter {
    settings: TripSettings,
    precision: Precision,
    state: State,
}

impl TripSegmenter {
    pub fn new(settings: TripSettings, precision: Precision) -> Self {
        TripSegmenter {
            settings,
            precision,
            state: State::NoTrip,
        }
    }

    pub fn current(&self) -> Option<&OpenTrip> {
        match &self.state {
            State::Open(trip) => Some(trip),
            State::NoTrip => None,
        }
    }

    /// Feed the next accepted position. Returns the trip it closed, if any.
    ///
    /// Positions must arrive in timestamp order; the normalizer guarantees it.
    pub fn push(&mut self, position: Position) -> Option<Trip> {
        match std::mem::replace(&mut self.state, State::NoTrip) {
            State::NoTrip => {
                self.state = State::Open(OpenTrip::start(position));
                None
            }
            State::Open(mut trip) => {
                let gap = (position.timestamp - trip.end_utc_at).num_seconds();
                if gap > self.settings.max_gap_secs {
                    info!(
                        device_id = %trip.device_id,
                        gap_secs = gap,
                        "Silence exceeded max gap, splitting trip"
                    );
                    let closed = self.finish(trip);
                    self.state = State::Open(OpenTrip::start(position));
                    Some(closed)
                } else {
                    trip.extend(position, &self.settings);
                    self.state = State::Open(trip);
                    None
                }
            }
        }
    }

    /// Close the open trip without waiting for another sample.
    pub fn close(&mut self) -> Option<Trip> {
        match std::mem::replace(&mut self.state, State::NoTrip) {
            State::Open(trip) => Some(self.finish(trip)),
            State::NoTrip => None,
        }
    }

    fn finish(&self, trip: OpenTrip) -> Trip {
        let trip = trip.close(&self.settings, &self.precision);
        info!(
            device_id = %trip.device_id,
            trip_id = %trip.id,
            start = %trip.start_utc_at,
            end = %trip.end_utc_at,
            distance_m = trip.distance,
            time_secs = trip.time,
            positions = trip.positions.len(),
            "Trip closed"
        );
        trip
    }
}
