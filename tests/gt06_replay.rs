use approx::assert_relative_eq;
use chrono::{TimeZone, Utc};
use std::io::Write;

use tracker_core::config::Config;
use tracker_core::dispatch::Dispatcher;
use tracker_core::protocol::gt06::{encode_packet, MSG_GPS_LBS, MSG_LOGIN};
use tracker_core::protocol::Protocol;
use tracker_core::replay::replay_file;
use tracker_core::session::{SessionRegistry, SessionSettings};
use tracker_core::storage::MemoryGateway;

const IMEI: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45];

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn gps(second: u8, lat: f64, speed: u8) -> Vec<u8> {
    let mut info = vec![23, 5, 25, 16, 24, second, 0xc9];
    info.extend_from_slice(&((lat * 1_800_000.0).round() as u32).to_be_bytes());
    info.extend_from_slice(&((7.87789_f64 * 1_800_000.0).round() as u32).to_be_bytes());
    info.push(speed);
    // positioned, north, west, course 215
    info.extend_from_slice(&(0x1c00_u16 | 215).to_be_bytes());
    info.extend_from_slice(&[0x01, 0xcc, 0x00, 0x28, 0x7d, 0x00, 0x1f, 0xb8]);
    info
}

#[tokio::test]
async fn recorded_gt06_hex_log_is_stored() {
    let login = encode_packet(MSG_LOGIN, &IMEI, 1);
    let first = encode_packet(MSG_GPS_LBS, &gps(25, 42.35242, 20), 2);
    let second = encode_packet(MSG_GPS_LBS, &gps(41, 42.35300, 30), 3);

    let mut log = tempfile::NamedTempFile::new().unwrap();
    writeln!(log, "# gt06 bench capture").unwrap();
    writeln!(log, "hex:{}", hex(&login)).unwrap();
    writeln!(log, "hex:{}", hex(&first)).unwrap();
    writeln!(log, "hex:78780").unwrap();
    // one packet split across two reads
    writeln!(log, "hex:{}", hex(&second[..9])).unwrap();
    writeln!(log, "hex:{}", hex(&second[9..])).unwrap();
    log.flush().unwrap();

    let config = Config::default();
    let gateway = MemoryGateway::new();
    let (dispatch, dispatcher) = Dispatcher::spawn(gateway.clone(), None, config.gateway);
    let registry = SessionRegistry::new(SessionSettings {
        trip: config.trip,
        precision: config.precision,
    });

    let report = replay_file(log.path(), Protocol::Gt06, &registry, &dispatch)
        .await
        .unwrap();
    assert!(dispatch.shutdown().await.is_empty());
    dispatcher.await.unwrap();

    assert_eq!(report.device_id.as_deref(), Some("123456789012345"));
    assert_eq!(report.lines, 4);
    assert_eq!(report.bad_lines, 1);
    assert_eq!(report.positions, 2);
    assert_eq!(report.trips, 1);

    let store = gateway.store();
    assert_eq!(store.devices.len(), 1);
    assert_eq!(store.devices[0].protocol, Protocol::Gt06);
    assert_eq!(store.positions.len(), 2);
    assert_eq!(store.trips.len(), 1);

    let trip = &store.trips[0];
    assert_eq!(trip.start_utc_at, Utc.with_ymd_and_hms(2023, 5, 25, 16, 24, 25).unwrap());
    assert_eq!(trip.end_utc_at, Utc.with_ymd_and_hms(2023, 5, 25, 16, 24, 41).unwrap());
    assert_eq!(trip.time, 16);
    assert!(trip.distance > 0);

    let last = &trip.positions[1];
    assert_eq!(last.sequence, 2);
    assert_relative_eq!(last.latitude, 42.353);
    assert_relative_eq!(last.longitude, -7.87789);
    assert_relative_eq!(last.speed, 30.0);
    assert_eq!(last.direction, 215);
}
