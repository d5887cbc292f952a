//! H02 family.
//!
//! Text frames are delimited, `*` to `#`, comma separated:
//!
//! ```text
//! *HQ,1234567890,V1,162425,A,4221.1452,N,00752.6734,W,1.30,000,250523,FFFFFBFF#
//!     id         type time  fix lat      hemi lon    hemi knots course date status
//! ```
//!
//! Binary frames are a fixed 32 bytes starting with `$`, packed BCD:
//!
//! ```text
//! $ | id(5) | hhmmss(3) | ddmmyy(3) | lat ddmmmmmm(4) | battery(1)
//!   | lon dddmmmmmm + flags nibble(5) | speed knots sss + course ccc(3)
//!   | status(4) | reserved(3)
//! ```
//!
//! Neither variant expects an acknowledgement.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::{bcd_digits, skip_to_marker, Frame, Protocol};
use crate::error::FrameError;
use crate::types::{RawCoordinate, RawSpeed, RawTelemetry, RawTimestamp};

pub const BINARY_FRAME_LEN: usize = 32;
const MAX_TEXT_FRAME: usize = 1024;

const FLAG_VALID: u8 = 0x02;
const FLAG_NORTH: u8 = 0x04;
const FLAG_EAST: u8 = 0x08;

#[derive(Debug, Clone, Copy, Default)]
pub struct H02Codec;

fn is_marker(rest: &[u8]) -> bool {
    matches!(rest.first(), Some(b'*') | Some(b'$'))
}

fn malformed(reason: impl Into<String>) -> FrameError {
    FrameError::malformed(Protocol::H02, reason)
}

impl Decoder for H02Codec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let lead = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(lead);

        match src.first() {
            None => Ok(None),
            Some(b'*') => decode_text(src),
            Some(b'$') => decode_binary(src),
            Some(_) => {
                skip_to_marker(src, 1, is_marker);
                Err(malformed("unexpected bytes before frame marker"))
            }
        }
    }
}

fn decode_text(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let end = src.iter().position(|&b| b == b'#');
    // A second '*' before the terminator means the first frame was cut short.
    let restart = src[1..].iter().position(|&b| b == b'*').map(|i| i + 1);

    match (end, restart) {
        (Some(end), restart) if restart.map_or(true, |r| r > end) => {
            let frame = src.split_to(end + 1);
            parse_text(&frame[1..end]).map(Some)
        }
        (_, Some(restart)) => {
            src.advance(restart);
            Err(malformed("truncated text frame"))
        }
        (None, None) if src.len() > MAX_TEXT_FRAME => {
            skip_to_marker(src, 1, is_marker);
            Err(malformed("text frame exceeds maximum length"))
        }
        _ => Ok(None),
    }
}

fn parse_text(body: &[u8]) -> Result<Frame, FrameError> {
    let text = std::str::from_utf8(body).map_err(|_| malformed("text frame is not UTF-8"))?;
    let fields: Vec<&str> = text.split(',').map(str::trim).collect();
    if fields.len() < 3 {
        return Err(malformed("missing header fields"));
    }

    let id = fields[1];
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(malformed(format!("invalid device id {id:?}")));
    }

    let telemetry = match fields[2] {
        "V1" => Some(parse_position(&fields[3..])?),
        // Command receipts echo the command name before the position block.
        "V4" if fields.len() > 4 => Some(parse_position(&fields[4..])?),
        _ => None,
    };

    Ok(Frame {
        device_id: Some(id.to_string()),
        telemetry,
        ack: None,
    })
}

fn parse_position(f: &[&str]) -> Result<RawTelemetry, FrameError> {
    if f.len() < 9 {
        return Err(malformed("position block too short"));
    }

    let (hour, minute, second) = digit_pairs(f[0]).ok_or_else(|| malformed("bad time field"))?;
    let (day, month, year) = digit_pairs(f[8]).ok_or_else(|| malformed("bad date field"))?;

    let valid = match f[1] {
        "A" => true,
        "V" => false,
        other => return Err(malformed(format!("bad validity flag {other:?}"))),
    };

    let latitude = text_coordinate(f[2], f[3], ('N', 'S'))?;
    let longitude = text_coordinate(f[4], f[5], ('E', 'W'))?;

    let speed: f64 = f[6].parse().map_err(|_| malformed("bad speed field"))?;
    let course: f64 = if f[7].is_empty() {
        0.0
    } else {
        f[7].parse().map_err(|_| malformed("bad course field"))?
    };

    Ok(RawTelemetry {
        timestamp: RawTimestamp {
            year: 2000 + year as i32,
            month,
            day,
            hour,
            minute,
            second,
        },
        latitude,
        longitude,
        speed: RawSpeed::Knots(speed),
        course: course.round().clamp(0.0, u16::MAX as f64) as u16,
        valid,
    })
}

/// `"162425"` to `(16, 24, 25)`. Trailing fractions are ignored.
fn digit_pairs(s: &str) -> Option<(u32, u32, u32)> {
    let digits = s.get(..6)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let pair = |i: usize| digits[i..i + 2].parse::<u32>().ok();
    Some((pair(0)?, pair(2)?, pair(4)?))
}

fn text_coordinate(
    value: &str,
    hemisphere: &str,
    (positive, negative): (char, char),
) -> Result<RawCoordinate, FrameError> {
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return Err(malformed(format!("bad coordinate {value:?}")));
    }
    let (degrees, minutes) = value.split_at(dot - 2);
    let degrees: u32 = degrees
        .parse()
        .map_err(|_| malformed(format!("bad coordinate {value:?}")))?;
    let minutes: f64 = minutes
        .parse()
        .map_err(|_| malformed(format!("bad coordinate {value:?}")))?;

    let negative = match hemisphere.chars().next() {
        Some(c) if c == positive => false,
        Some(c) if c == negative => true,
        _ => return Err(malformed(format!("bad hemisphere {hemisphere:?}"))),
    };

    Ok(RawCoordinate::DegreesMinutes {
        degrees,
        minutes,
        negative,
    })
}

fn decode_binary(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if src.len() < BINARY_FRAME_LEN {
        return Ok(None);
    }

    match parse_binary(&src[..BINARY_FRAME_LEN]) {
        Ok(frame) => {
            src.advance(BINARY_FRAME_LEN);
            Ok(Some(frame))
        }
        Err(e) => {
            // The '$' may have been noise; look for the next frame inside.
            skip_to_marker(src, 1, is_marker);
            Err(e)
        }
    }
}

fn parse_binary(b: &[u8]) -> Result<Frame, FrameError> {
    let bcd = |range: std::ops::Range<usize>, what: &str| {
        bcd_digits(&b[range]).ok_or_else(|| malformed(format!("bad BCD in {what}")))
    };

    let id = bcd(1..6, "device id")?;
    let time = bcd(6..9, "time")?;
    let date = bcd(9..12, "date")?;
    let lat = bcd(12..16, "latitude")?;
    let lon_head = bcd(17..21, "longitude")?;
    let lon_tail = b[21] >> 4;
    if lon_tail > 9 {
        return Err(malformed("bad BCD in longitude"));
    }
    let flags = b[21] & 0x0f;
    let motion = bcd(22..25, "speed and course")?;

    let (hour, minute, second) = digit_pairs(&time).ok_or_else(|| malformed("bad time field"))?;
    let (day, month, year) = digit_pairs(&date).ok_or_else(|| malformed("bad date field"))?;

    let lon = format!("{lon_head}{lon_tail}");
    let minutes = |whole: &str, frac: &str| -> Result<f64, FrameError> {
        format!("{whole}.{frac}")
            .parse()
            .map_err(|_| malformed("bad coordinate minutes"))
    };
    let latitude = RawCoordinate::DegreesMinutes {
        degrees: lat[..2].parse().map_err(|_| malformed("bad latitude"))?,
        minutes: minutes(&lat[2..4], &lat[4..8])?,
        negative: flags & FLAG_NORTH == 0,
    };
    let longitude = RawCoordinate::DegreesMinutes {
        degrees: lon[..3].parse().map_err(|_| malformed("bad longitude"))?,
        minutes: minutes(&lon[3..5], &lon[5..9])?,
        negative: flags & FLAG_EAST == 0,
    };

    let speed: u32 = motion[..3].parse().map_err(|_| malformed("bad speed"))?;
    let course: u16 = motion[3..].parse().map_err(|_| malformed("bad course"))?;

    Ok(Frame {
        device_id: Some(id),
        telemetry: Some(RawTelemetry {
            timestamp: RawTimestamp {
                year: 2000 + year as i32,
                month,
                day,
                hour,
                minute,
                second,
            },
            latitude,
            longitude,
            speed: RawSpeed::Knots(speed as f64),
            course,
            valid: flags & FLAG_VALID != 0,
        }),
        ack: None,
    })
}
