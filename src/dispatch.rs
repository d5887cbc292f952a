//! Hand-off to the storage gateway.
//!
//! Ingestion submits [`Record`]s through a [`DispatchHandle`] and never
//! waits. A single worker drains them in order into the gateway. When the
//! head record fails it stays queued, the worker backs off exponentially, and
//! new records keep piling up behind it. After `max_attempts` failures the
//! record is moved to the back of the queue so one poisoned record cannot
//! hold the rest hostage.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::GatewaySettings;
use crate::error::TrackerError;
use crate::geocode::Geocoder;
use crate::session::LinkOutput;
use crate::storage::StorageGateway;
use crate::types::{Device, Position, Trip};

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Device(Device),
    Positions {
        device_id: String,
        positions: Vec<Position>,
    },
    Trip(Box<Trip>),
}

impl Record {
    fn kind(&self) -> &'static str {
        match self {
            Record::Device(_) => "device",
            Record::Positions { .. } => "positions",
            Record::Trip(_) => "trip",
        }
    }
}

enum Command {
    Submit(Record),
    Shutdown(oneshot::Sender<Vec<Record>>),
}

#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatchHandle {
    pub fn submit(&self, record: Record) {
        if self.tx.send(Command::Submit(record)).is_err() {
            error!("Dispatcher is gone, record dropped");
        }
    }

    /// Queue everything one link read produced: a new device first, then
    /// positions, then the trips they closed.
    pub fn forward(&self, output: &mut LinkOutput) {
        if let Some(device) = output.new_device.take() {
            self.submit(Record::Device(device));
        }
        let accepted = &mut output.accepted;
        if !accepted.positions.is_empty() {
            let positions = std::mem::take(&mut accepted.positions);
            self.submit(Record::Positions {
                device_id: positions[0].device_id.clone(),
                positions,
            });
        }
        for trip in accepted.closed.drain(..) {
            self.submit(Record::Trip(Box::new(trip)));
        }
    }

    pub fn submit_trip(&self, trip: Trip) {
        self.submit(Record::Trip(Box::new(trip)));
    }

    /// Flush what can be flushed and stop the worker. Returns the records
    /// the gateway still refused.
    pub async fn shutdown(&self) -> Vec<Record> {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(reply)).is_err() {
            return Vec::new();
        }
        done.await.unwrap_or_default()
    }
}

struct Pending {
    record: Record,
    attempts: u32,
}

pub struct Dispatcher<G> {
    gateway: G,
    geocoder: Option<Geocoder>,
    settings: GatewaySettings,
    outbox: VecDeque<Pending>,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl<G: StorageGateway + 'static> Dispatcher<G> {
    pub fn spawn(
        gateway: G,
        geocoder: Option<Geocoder>,
        settings: GatewaySettings,
    ) -> (DispatchHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            gateway,
            geocoder,
            settings,
            outbox: VecDeque::new(),
            backoff: settings.backoff_initial(),
            retry_at: None,
        };
        let task = tokio::spawn(dispatcher.run(rx));
        (DispatchHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.retry_at;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Submit(record)) => {
                        self.outbox.push_back(Pending { record, attempts: 0 });
                    }
                    Some(Command::Shutdown(reply)) => {
                        let left = self.drain().await;
                        let _ = reply.send(left);
                        return;
                    }
                    None => {
                        let left = self.drain().await;
                        if !left.is_empty() {
                            error!(count = left.len(), "Records lost at dispatcher exit");
                        }
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.retry_at = None;
                }
            }

            if self.retry_at.is_none() {
                self.flush().await;
            }
        }
    }

    async fn flush(&mut self) {
        while let Some(mut pending) = self.outbox.pop_front() {
            match self.store(&mut pending.record).await {
                Ok(()) => {
                    debug!(kind = pending.record.kind(), "Record stored");
                    self.backoff = self.settings.backoff_initial();
                }
                Err(e) => {
                    pending.attempts += 1;
                    let failure = TrackerError::Gateway(e);
                    warn!(
                        kind = pending.record.kind(),
                        attempts = pending.attempts,
                        backoff_ms = self.backoff.as_millis() as u64,
                        queued = self.outbox.len() + 1,
                        error = %failure,
                        "Storage gateway call failed"
                    );
                    if pending.attempts >= self.settings.max_attempts {
                        error!(
                            kind = pending.record.kind(),
                            "Giving up for now, moving record to the back of the queue"
                        );
                        pending.attempts = 0;
                        self.outbox.push_back(pending);
                    } else {
                        self.outbox.push_front(pending);
                    }
                    self.retry_at = Some(Instant::now() + self.backoff);
                    self.backoff = (self.backoff * 2).min(self.settings.backoff_max());
                    return;
                }
            }
        }
    }

    /// One last attempt per record; returns the ones that still failed.
    async fn drain(&mut self) -> Vec<Record> {
        let mut left = Vec::new();
        while let Some(mut pending) = self.outbox.pop_front() {
            if let Err(e) = self.store(&mut pending.record).await {
                warn!(kind = pending.record.kind(), error = %e, "Record not stored at shutdown");
                left.push(pending.record);
            }
        }
        info!(unsaved = left.len(), "Dispatcher stopped");
        left
    }

    async fn store(&mut self, record: &mut Record) -> anyhow::Result<()> {
        match record {
            Record::Device(device) => self.gateway.save_device(device),
            Record::Positions {
                device_id,
                positions,
            } => self.gateway.save_positions(device_id, positions),
            Record::Trip(trip) => {
                if let Some(geocoder) = self.geocoder.as_mut() {
                    geocoder.annotate(trip).await;
                }
                self.gateway.save_trip(trip)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use crate::storage::{MemoryGateway, SqliteGateway};
    use crate::types::Stats;
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn settings() -> GatewaySettings {
        GatewaySettings {
            max_attempts: 2,
            backoff_initial_ms: 10,
            backoff_max_ms: 40,
        }
    }

    fn device(serial: &str) -> Record {
        Record::Device(Device {
            serial: serial.into(),
            protocol: Protocol::H02,
            first_seen_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn stores_records_in_order() {
        let gateway = MemoryGateway::new();
        let (handle, task) = Dispatcher::spawn(gateway.clone(), None, settings());

        handle.submit(device("a"));
        handle.submit(device("b"));
        assert!(handle.shutdown().await.is_empty());
        task.await.unwrap();

        let serials: Vec<String> = gateway
            .store()
            .devices
            .iter()
            .map(|d| d.serial.clone())
            .collect();
        assert_eq!(serials, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn retries_after_transient_failures() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(3);
        let (handle, task) = Dispatcher::spawn(gateway.clone(), None, settings());

        handle.submit(device("a"));
        handle.submit(device("b"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while gateway.store().devices.len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.shutdown().await.is_empty());
        task.await.unwrap();

        assert_eq!(gateway.store().devices.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_returns_unsaved_records() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(u32::MAX);
        let (handle, task) = Dispatcher::spawn(gateway.clone(), None, settings());

        handle.submit(device("a"));
        let left = handle.shutdown().await;
        task.await.unwrap();

        assert_eq!(left.len(), 1);
        assert!(matches!(&left[0], Record::Device(d) if d.serial == "a"));
        assert!(gateway.store().devices.is_empty());
    }

    #[tokio::test]
    async fn record_failing_too_often_moves_behind_the_queue() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(2);
        let (handle, task) = Dispatcher::spawn(gateway.clone(), None, settings());

        handle.submit(device("a"));
        handle.submit(device("b"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while gateway.store().devices.len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.shutdown().await.is_empty());
        task.await.unwrap();

        let serials: Vec<String> = gateway
            .store()
            .devices
            .iter()
            .map(|d| d.serial.clone())
            .collect();
        assert_eq!(serials, vec!["b", "a"]);
    }

    /// SQLite gateway whose position batches fail a set number of times.
    struct FlakyPositions {
        inner: Arc<Mutex<SqliteGateway>>,
        failures: u32,
    }

    impl StorageGateway for FlakyPositions {
        fn save_device(&mut self, device: &Device) -> anyhow::Result<()> {
            self.inner.lock().unwrap().save_device(device)
        }

        fn save_positions(&mut self, device_id: &str, positions: &[Position]) -> anyhow::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                anyhow::bail!("positions table locked");
            }
            self.inner.lock().unwrap().save_positions(device_id, positions)
        }

        fn save_trip(&mut self, trip: &Trip) -> anyhow::Result<()> {
            self.inner.lock().unwrap().save_trip(trip)
        }
    }

    fn count(db: &Arc<Mutex<SqliteGateway>>, sql: &str) -> i64 {
        db.lock().unwrap().connection().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[tokio::test]
    async fn trip_overtaking_its_positions_keeps_them_linked() {
        let db = Arc::new(Mutex::new(SqliteGateway::in_memory().unwrap()));
        let gateway = FlakyPositions {
            inner: db.clone(),
            failures: 2,
        };
        let (handle, task) = Dispatcher::spawn(gateway, None, settings());

        let start = Utc.with_ymd_and_hms(2023, 5, 25, 16, 24, 25).unwrap();
        let positions: Vec<Position> = (0..2)
            .map(|i| Position {
                device_id: "1234567890".into(),
                sequence: i + 1,
                timestamp: start + chrono::Duration::seconds(i as i64 * 16),
                latitude: 42.35242,
                longitude: -7.87789,
                speed: 2.41,
                direction: 0,
                signal: 1,
            })
            .collect();
        let trip = Trip {
            id: Uuid::new_v4(),
            device_id: "1234567890".into(),
            start_utc_at: positions[0].timestamp,
            end_utc_at: positions[1].timestamp,
            distance: 0,
            time: 16,
            stats: Stats::default(),
            start_address: None,
            end_address: None,
            positions: positions.clone(),
        };

        handle.submit(Record::Positions {
            device_id: "1234567890".into(),
            positions,
        });
        handle.submit_trip(trip);

        let deadline = Instant::now() + Duration::from_secs(5);
        while count(&db, "SELECT COUNT(*) FROM trips") == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.shutdown().await.is_empty());
        task.await.unwrap();

        assert_eq!(count(&db, "SELECT COUNT(*) FROM positions"), 2);
        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM positions WHERE trip_id IS NOT NULL"),
            2
        );
    }
}
