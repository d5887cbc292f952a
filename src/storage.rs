use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::protocol::Protocol;
use crate::types::{Device, Position, Trip};

const UPSERT_POSITION: &str = "INSERT INTO positions
        (device_id, sequence, date_utc_at, latitude, longitude, speed, direction, signal, trip_id)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT (device_id, date_utc_at) DO UPDATE SET
        sequence = excluded.sequence,
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        speed = excluded.speed,
        direction = excluded.direction,
        signal = excluded.signal,
        trip_id = COALESCE(excluded.trip_id, positions.trip_id)";

/// Where devices, positions and closed trips end up. Every call may fail
/// transiently; the dispatcher retries.
pub trait StorageGateway: Send {
    fn save_device(&mut self, device: &Device) -> Result<()>;
    fn save_positions(&mut self, device_id: &str, positions: &[Position]) -> Result<()>;
    fn save_trip(&mut self, trip: &Trip) -> Result<()>;
}

pub struct SqliteGateway {
    conn: Connection,
}

impl SqliteGateway {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("Initializing tracker database at {}", path.display());
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                serial TEXT PRIMARY KEY,
                protocol TEXT NOT NULL,
                first_seen_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY,
                device_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                date_utc_at TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                speed REAL NOT NULL,
                direction INTEGER NOT NULL,
                signal INTEGER NOT NULL,
                trip_id TEXT,
                UNIQUE (device_id, date_utc_at)
            );
            CREATE TABLE IF NOT EXISTS trips (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                start_utc_at TEXT NOT NULL,
                end_utc_at TEXT NOT NULL,
                distance INTEGER NOT NULL,
                time INTEGER NOT NULL,
                stats TEXT NOT NULL,
                start_address TEXT,
                end_address TEXT
            );",
        )?;
        info!("Database initialization complete.");
        Ok(SqliteGateway { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StorageGateway for SqliteGateway {
    fn save_device(&mut self, device: &Device) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO devices (serial, protocol, first_seen_at) VALUES (?1, ?2, ?3)",
            params![device.serial, device.protocol.name(), device.first_seen_at],
        )?;
        Ok(())
    }

    fn save_positions(&mut self, device_id: &str, positions: &[Position]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_POSITION)?;
            for p in positions {
                upsert_position(&mut stmt, device_id, p, None)?;
            }
        }
        tx.commit()?;
        debug!(device_id, count = positions.len(), "Stored positions");
        Ok(())
    }

    fn save_trip(&mut self, trip: &Trip) -> Result<()> {
        if trip.positions.is_empty() {
            return Err(anyhow!("trip {} has no positions", trip.id));
        }
        let trip_id = trip.id.to_string();
        let stats = serde_json::to_string(&trip.stats)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO trips (id, device_id, start_utc_at, end_utc_at, distance, time, stats, start_address, end_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trip_id,
                trip.device_id,
                trip.start_utc_at,
                trip.end_utc_at,
                trip.distance as i64,
                trip.time,
                stats,
                trip.start_address,
                trip.end_address,
            ],
        )?;
        {
            // The trip carries its positions, so it owns them even when the
            // positions batch has not been stored yet.
            let mut stmt = tx.prepare(UPSERT_POSITION)?;
            for p in &trip.positions {
                upsert_position(&mut stmt, &trip.device_id, p, Some(&trip_id))?;
            }
        }
        tx.commit()?;
        info!(trip_id = %trip.id, device_id = %trip.device_id, "Stored trip");
        Ok(())
    }
}

fn upsert_position(
    stmt: &mut rusqlite::Statement<'_>,
    device_id: &str,
    p: &Position,
    trip_id: Option<&str>,
) -> Result<()> {
    stmt.execute(params![
        device_id,
        p.sequence as i64,
        p.timestamp,
        p.latitude,
        p.longitude,
        p.speed,
        p.direction,
        p.signal,
        trip_id,
    ])?;
    Ok(())
}

impl SqliteGateway {
    /// Every stored device with its most recent position, for seeding the
    /// session registry at startup.
    pub fn load_sessions(&self) -> Result<Vec<(Device, Option<Position>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.serial, d.protocol, d.first_seen_at,
                    p.sequence, p.date_utc_at, p.latitude, p.longitude, p.speed, p.direction, p.signal
             FROM devices d
             LEFT JOIN positions p ON p.id = (
                SELECT id FROM positions WHERE device_id = d.serial
                ORDER BY date_utc_at DESC LIMIT 1
             )",
        )?;
        let rows = stmt.query_map([], |row| {
            let serial: String = row.get(0)?;
            let protocol: String = row.get(1)?;
            let first_seen_at: DateTime<Utc> = row.get(2)?;
            let device = (serial.clone(), protocol, first_seen_at);
            let last = match row.get::<_, Option<i64>>(3)? {
                Some(sequence) => Some(Position {
                    device_id: serial,
                    sequence: sequence as u64,
                    timestamp: row.get(4)?,
                    latitude: row.get(5)?,
                    longitude: row.get(6)?,
                    speed: row.get(7)?,
                    direction: row.get(8)?,
                    signal: row.get(9)?,
                }),
                None => None,
            };
            Ok((device, last))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let ((serial, protocol, first_seen_at), last) = row?;
            let protocol: Protocol = protocol.parse()?;
            sessions.push((
                Device {
                    serial,
                    protocol,
                    first_seen_at,
                },
                last,
            ));
        }
        Ok(sessions)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub devices: Vec<Device>,
    pub positions: Vec<Position>,
    pub trips: Vec<Trip>,
    /// Number of upcoming calls that fail before the store accepts again.
    pub fail_next: u32,
}

impl MemoryStore {
    fn upsert_position(&mut self, position: &Position) {
        let existing = self
            .positions
            .iter_mut()
            .find(|p| p.device_id == position.device_id && p.timestamp == position.timestamp);
        match existing {
            Some(p) => *p = position.clone(),
            None => self.positions.push(position.clone()),
        }
    }
}

/// In-process gateway. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next(&self, calls: u32) {
        self.store().fail_next = calls;
    }

    fn guard(&self) -> Result<MutexGuard<'_, MemoryStore>> {
        let mut store = self.store();
        if store.fail_next > 0 {
            store.fail_next -= 1;
            return Err(anyhow!("memory store unavailable"));
        }
        Ok(store)
    }
}

impl StorageGateway for MemoryGateway {
    fn save_device(&mut self, device: &Device) -> Result<()> {
        let mut store = self.guard()?;
        if !store.devices.iter().any(|d| d.serial == device.serial) {
            store.devices.push(device.clone());
        }
        Ok(())
    }

    fn save_positions(&mut self, _device_id: &str, positions: &[Position]) -> Result<()> {
        let mut store = self.guard()?;
        for p in positions {
            store.upsert_position(p);
        }
        Ok(())
    }

    fn save_trip(&mut self, trip: &Trip) -> Result<()> {
        let mut store = self.guard()?;
        for p in &trip.positions {
            store.upsert_position(p);
        }
        store.trips.push(trip.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Stats;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    fn position(sequence: u64) -> Position {
        Position {
            device_id: "1234567890".into(),
            sequence,
            timestamp: Utc.with_ymd_and_hms(2023, 5, 25, 16, 24, 25).unwrap()
                + Duration::seconds(sequence as i64 * 16),
            latitude: 42.35242,
            longitude: -7.87789,
            speed: 2.41,
            direction: 0,
            signal: 1,
        }
    }

    fn trip(positions: Vec<Position>) -> Trip {
        Trip {
            id: Uuid::new_v4(),
            device_id: "1234567890".into(),
            start_utc_at: positions[0].timestamp,
            end_utc_at: positions[positions.len() - 1].timestamp,
            distance: 1940,
            time: 616,
            stats: Stats::default(),
            start_address: Some("Ourense".into()),
            end_address: None,
            positions,
        }
    }

    #[test]
    fn sqlite_links_positions_to_trip() {
        let file = NamedTempFile::new().unwrap();
        let mut gateway = SqliteGateway::open(file.path()).unwrap();

        gateway
            .save_device(&Device {
                serial: "1234567890".into(),
                protocol: Protocol::H02,
                first_seen_at: Utc::now(),
            })
            .unwrap();
        let positions: Vec<Position> = (1..=3).map(position).collect();
        gateway.save_positions("1234567890", &positions).unwrap();
        // a retried batch is ignored
        gateway.save_positions("1234567890", &positions).unwrap();
        gateway.save_positions("1234567890", &[position(4)]).unwrap();

        let trip = trip(positions);
        gateway.save_trip(&trip).unwrap();

        let conn = gateway.connection();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM positions", [], |row| row.get(0))
            .unwrap();
        let linked: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM positions WHERE trip_id = ?1",
                params![trip.id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        let stats: String = conn
            .query_row("SELECT stats FROM trips", [], |row| row.get(0))
            .unwrap();

        assert_eq!(total, 4);
        assert_eq!(linked, 3);
        assert!(stats.starts_with("{\"time\":{\"total\":0"));
    }

    fn linked_rows(gateway: &SqliteGateway, trip: &Trip) -> i64 {
        gateway
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM positions WHERE trip_id = ?1",
                params![trip.id.to_string()],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn trip_stored_before_its_positions_still_owns_them() {
        let mut gateway = SqliteGateway::in_memory().unwrap();
        let positions: Vec<Position> = (1..=2).map(position).collect();
        let trip = trip(positions.clone());

        gateway.save_trip(&trip).unwrap();
        gateway.save_positions("1234567890", &positions).unwrap();

        let total: i64 = gateway
            .connection()
            .query_row("SELECT COUNT(*) FROM positions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(linked_rows(&gateway, &trip), 2);
    }

    #[test]
    fn later_positions_with_reused_sequences_are_kept() {
        let mut gateway = SqliteGateway::in_memory().unwrap();
        let first = trip((1..=2).map(position).collect());
        gateway.save_positions("1234567890", &first.positions).unwrap();
        gateway.save_trip(&first).unwrap();

        // same sequence numbers, later samples
        let later: Vec<Position> = (1..=2)
            .map(|seq| {
                let mut p = position(seq);
                p.timestamp += Duration::hours(1);
                p
            })
            .collect();
        let second = trip(later);
        gateway.save_positions("1234567890", &second.positions).unwrap();
        gateway.save_trip(&second).unwrap();

        assert_eq!(linked_rows(&gateway, &first), 2);
        assert_eq!(linked_rows(&gateway, &second), 2);
    }

    #[test]
    fn sessions_load_with_latest_position() {
        let mut gateway = SqliteGateway::in_memory().unwrap();
        gateway
            .save_device(&Device {
                serial: "1234567890".into(),
                protocol: Protocol::Gt06,
                first_seen_at: Utc::now(),
            })
            .unwrap();
        gateway
            .save_device(&Device {
                serial: "quiet".into(),
                protocol: Protocol::H02,
                first_seen_at: Utc::now(),
            })
            .unwrap();
        gateway
            .save_positions("1234567890", &[position(2), position(3), position(1)])
            .unwrap();

        let mut sessions = gateway.load_sessions().unwrap();
        sessions.sort_by(|a, b| a.0.serial.cmp(&b.0.serial));

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].0.protocol, Protocol::Gt06);
        assert_eq!(sessions[0].1, Some(position(3)));
        assert_eq!(sessions[1].0.serial, "quiet");
        assert_eq!(sessions[1].1, None);
    }

    #[test]
    fn empty_trip_is_refused() {
        let mut gateway = SqliteGateway::in_memory().unwrap();
        let mut empty = trip(vec![position(1)]);
        empty.positions.clear();
        assert!(gateway.save_trip(&empty).is_err());
    }

    #[test]
    fn memory_gateway_failure_budget() {
        let mut gateway = MemoryGateway::new();
        gateway.fail_next(2);
        assert!(gateway.save_positions("d", &[position(1)]).is_err());
        assert!(gateway.save_positions("d", &[position(1)]).is_err());
        assert!(gateway.save_positions("d", &[position(1)]).is_ok());
        assert_eq!(gateway.store().positions.len(), 1);
    }
}
