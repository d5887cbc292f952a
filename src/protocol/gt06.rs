//! GT06 family, length prefixed.
//!
//! ```text
//! 78 78 | len | proto | info ... | serial(2) | crc(2) | 0D 0A
//! 79 79 | len(2) | ...                       (extended length)
//! ```
//!
//! `len` counts from `proto` to `crc` inclusive. The CRC is CRC-16/X.25 over
//! everything from the length field through the serial number. Logins and
//! heartbeats are acknowledged by echoing the protocol number and serial.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::{bcd_digits, skip_to_marker, Frame, Protocol};
use crate::error::FrameError;
use crate::types::{RawCoordinate, RawSpeed, RawTelemetry, RawTimestamp};

pub const START: [u8; 2] = [0x78, 0x78];
pub const START_EXTENDED: [u8; 2] = [0x79, 0x79];
const STOP: [u8; 2] = [0x0d, 0x0a];

pub const MSG_LOGIN: u8 = 0x01;
pub const MSG_GPS_LBS: u8 = 0x12;
pub const MSG_HEARTBEAT: u8 = 0x13;
pub const MSG_GPS_LBS_2: u8 = 0x22;

const GPS_BLOCK_LEN: usize = 18;

const COURSE_MASK: u16 = 0x03ff;
const FLAG_NORTH: u16 = 0x0400;
const FLAG_WEST: u16 = 0x0800;
const FLAG_POSITIONED: u16 = 0x1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct Gt06Codec;

fn is_start(rest: &[u8]) -> bool {
    rest.starts_with(&START) || rest.starts_with(&START_EXTENDED)
}

fn malformed(reason: impl Into<String>) -> FrameError {
    FrameError::malformed(Protocol::Gt06, reason)
}

/// CRC-16/X.25 (CRC-ITU as the GT06 documents call it).
pub fn crc_itu(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0x8408 } else { crc >> 1 };
        }
    }
    !crc
}

/// Build a short-form packet around `info`.
pub fn encode_packet(protocol: u8, info: &[u8], serial: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(info.len() + 10);
    buf.put_slice(&START);
    buf.put_u8((info.len() + 5) as u8);
    buf.put_u8(protocol);
    buf.put_slice(info);
    buf.put_u16(serial);
    let crc = crc_itu(&buf[2..]);
    buf.put_u16(crc);
    buf.put_slice(&STOP);
    buf.freeze()
}

impl Decoder for Gt06Codec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }
        if !is_start(src) {
            if src.len() == 1 && (src[0] == START[0] || src[0] == START_EXTENDED[0]) {
                return Ok(None);
            }
            skip_to_marker(src, 1, is_start);
            return Err(malformed("unexpected bytes before start marker"));
        }

        let extended = src.starts_with(&START_EXTENDED);
        let header = if extended { 4 } else { 3 };
        if src.len() < header {
            return Ok(None);
        }
        let len = if extended {
            u16::from_be_bytes([src[2], src[3]]) as usize
        } else {
            src[2] as usize
        };
        if len < 5 {
            skip_to_marker(src, 2, is_start);
            return Err(malformed(format!("declared length {len} too short")));
        }

        let total = header + len + STOP.len();
        if src.len() < total {
            return Ok(None);
        }

        match parse_packet(&src[..total], header) {
            Ok(frame) => {
                src.advance(total);
                Ok(Some(frame))
            }
            Err(e) => {
                skip_to_marker(src, 2, is_start);
                Err(e)
            }
        }
    }
}

fn parse_packet(packet: &[u8], header: usize) -> Result<Frame, FrameError> {
    let total = packet.len();
    if packet[total - 2..] != STOP {
        return Err(malformed("missing stop bytes"));
    }

    let crc_at = total - 4;
    let expected = u16::from_be_bytes([packet[crc_at], packet[crc_at + 1]]);
    let actual = crc_itu(&packet[2..crc_at]);
    if expected != actual {
        return Err(malformed(format!(
            "crc mismatch: expected {expected:04x}, got {actual:04x}"
        )));
    }

    let protocol = packet[header];
    let serial = u16::from_be_bytes([packet[crc_at - 2], packet[crc_at - 1]]);
    let info = &packet[header + 1..crc_at - 2];

    match protocol {
        MSG_LOGIN => {
            if info.len() < 8 {
                return Err(malformed("login packet too short"));
            }
            let digits = bcd_digits(&info[..8]).ok_or_else(|| malformed("bad BCD in IMEI"))?;
            // 16 BCD digits carry a 15 digit IMEI behind a padding zero.
            let imei = digits[1..].to_string();
            Ok(Frame {
                device_id: Some(imei),
                telemetry: None,
                ack: Some(encode_packet(MSG_LOGIN, &[], serial)),
            })
        }
        MSG_GPS_LBS | MSG_GPS_LBS_2 => Ok(Frame {
            device_id: None,
            telemetry: Some(parse_gps(info)?),
            ack: None,
        }),
        MSG_HEARTBEAT => Ok(Frame {
            device_id: None,
            telemetry: None,
            ack: Some(encode_packet(MSG_HEARTBEAT, &[], serial)),
        }),
        _ => Ok(Frame {
            device_id: None,
            telemetry: None,
            ack: None,
        }),
    }
}

fn parse_gps(info: &[u8]) -> Result<RawTelemetry, FrameError> {
    if info.len() < GPS_BLOCK_LEN {
        return Err(malformed("gps block too short"));
    }
    let mut buf = info;

    let year = 2000 + buf.get_u8() as i32;
    let (month, day, hour, minute, second) = (
        buf.get_u8() as u32,
        buf.get_u8() as u32,
        buf.get_u8() as u32,
        buf.get_u8() as u32,
        buf.get_u8() as u32,
    );
    // length and satellite count nibbles
    buf.advance(1);
    let lat = buf.get_u32();
    let lon = buf.get_u32();
    let speed = buf.get_u8();
    let flags = buf.get_u16();

    Ok(RawTelemetry {
        timestamp: RawTimestamp {
            year,
            month,
            day,
            hour,
            minute,
            second,
        },
        latitude: RawCoordinate::ThirtyThousandthsOfMinute {
            value: lat,
            negative: flags & FLAG_NORTH == 0,
        },
        longitude: RawCoordinate::ThirtyThousandthsOfMinute {
            value: lon,
            negative: flags & FLAG_WEST != 0,
        },
        speed: RawSpeed::Kmh(speed as f64),
        course: flags & COURSE_MASK,
        valid: flags & FLAG_POSITIONED != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login() -> Bytes {
        encode_packet(
            MSG_LOGIN,
            &[0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45],
            0x0001,
        )
    }

    fn gps_info() -> Vec<u8> {
        let mut info = vec![23, 5, 25, 16, 24, 25, 0xc9];
        // 42.35242 N, 7.87789 W in 1/30000 minute
        info.extend_from_slice(&((42.35242_f64 * 1_800_000.0).round() as u32).to_be_bytes());
        info.extend_from_slice(&((7.87789_f64 * 1_800_000.0).round() as u32).to_be_bytes());
        info.push(40);
        let flags = FLAG_POSITIONED | FLAG_NORTH | FLAG_WEST | 215;
        info.extend_from_slice(&flags.to_be_bytes());
        // LBS block
        info.extend_from_slice(&[0x01, 0xcc, 0x00, 0x28, 0x7d, 0x00, 0x1f, 0xb8]);
        info
    }

    #[test]
    fn crc_matches_reference_login_packet() {
        // 78 78 0D 01 01 23 45 67 89 01 23 45 00 01 8C DD 0D 0A
        let packet = login();
        assert_eq!(&packet[packet.len() - 4..packet.len() - 2], &[0x8c, 0xdd]);
    }

    #[test]
    fn login_binds_imei_and_is_acknowledged() {
        let mut buf = BytesMut::from(&login()[..]);
        let frame = Gt06Codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.device_id.as_deref(), Some("123456789012345"));
        assert_eq!(
            frame.ack.unwrap(),
            Bytes::from_static(&[0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xd9, 0xdc, 0x0d, 0x0a])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_gps_packet() {
        let mut buf = BytesMut::from(&encode_packet(MSG_GPS_LBS, &gps_info(), 7)[..]);
        let frame = Gt06Codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.device_id, None);
        assert!(frame.ack.is_none());
        let raw = frame.telemetry.unwrap();
        assert_eq!(raw.speed, RawSpeed::Kmh(40.0));
        assert_eq!(raw.course, 215);
        assert!(raw.valid);
        assert!(matches!(
            raw.latitude,
            RawCoordinate::ThirtyThousandthsOfMinute { negative: false, .. }
        ));
        assert!(matches!(
            raw.longitude,
            RawCoordinate::ThirtyThousandthsOfMinute { negative: true, .. }
        ));
        assert_eq!(raw.timestamp.hour, 16);
    }

    #[test]
    fn heartbeat_is_acknowledged() {
        let mut buf = BytesMut::from(&encode_packet(MSG_HEARTBEAT, &[0x44, 0x06, 0x04, 0x00, 0x01], 9)[..]);
        let frame = Gt06Codec.decode(&mut buf).unwrap().unwrap();
        let ack = frame.ack.unwrap();
        assert_eq!(ack[3], MSG_HEARTBEAT);
        assert_eq!(&ack[4..6], &[0x00, 0x09]);
    }

    #[test]
    fn waits_for_whole_packet() {
        let packet = login();
        let mut buf = BytesMut::from(&packet[..1]);
        assert_eq!(Gt06Codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&packet[1..7]);
        assert_eq!(Gt06Codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&packet[7..]);
        assert!(Gt06Codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn corrupt_crc_is_dropped_and_stream_resumes() {
        let mut bad = login().to_vec();
        bad[5] ^= 0xff;
        let mut buf = BytesMut::from(&bad[..]);
        buf.extend_from_slice(&login());

        assert!(Gt06Codec.decode(&mut buf).is_err());
        let frame = Gt06Codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.device_id.as_deref(), Some("123456789012345"));
    }
}
