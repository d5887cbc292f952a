//! Wire protocol registry.
//!
//! A connection is resolved to one [`Protocol`] once, from the listener it
//! arrived on or by sniffing its first bytes. The protocol hands out a
//! [`Codec`], a `tokio_util` decoder that turns a rolling byte buffer into
//! [`Frame`]s. Codecs keep no telemetry state; the buffer belongs to the
//! caller so frames split across reads are reassembled there.

pub mod gt06;
pub mod h02;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::error::{FrameError, TrackerError};
use crate::types::RawTelemetry;

pub use gt06::Gt06Codec;
pub use h02::H02Codec;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    H02,
    Gt06,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::H02, Protocol::Gt06];

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::H02 => "h02",
            Protocol::Gt06 => "gt06",
        }
    }

    /// Guess the protocol from the first bytes a device sent.
    pub fn sniff(bytes: &[u8]) -> Option<Protocol> {
        let start = bytes.iter().position(|b| !b.is_ascii_whitespace())?;
        let bytes = &bytes[start..];

        if bytes.starts_with(b"*") || bytes.starts_with(b"$") {
            return Some(Protocol::H02);
        }
        if bytes.starts_with(&gt06::START) || bytes.starts_with(&gt06::START_EXTENDED) {
            return Some(Protocol::Gt06);
        }
        None
    }

    pub fn codec(&self) -> Codec {
        match self {
            Protocol::H02 => Codec::H02(H02Codec),
            Protocol::Gt06 => Codec::Gt06(Gt06Codec),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or(TrackerError::ProtocolUnresolved)
    }
}

/// What the transport knows about a connection when it is opened.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta<'a> {
    /// Protocol bound to the listener, if any.
    pub declared: Option<&'a str>,
    /// First bytes received on the connection.
    pub peek: &'a [u8],
    pub peer: Option<SocketAddr>,
}

pub fn resolve(meta: &ConnectionMeta<'_>) -> Result<Protocol, TrackerError> {
    if let Some(declared) = meta.declared {
        return declared.parse();
    }
    Protocol::sniff(meta.peek).ok_or(TrackerError::ProtocolUnresolved)
}

/// One decoded unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Identity carried by the frame itself; GT06 only sends it at login.
    pub device_id: Option<String>,
    pub telemetry: Option<RawTelemetry>,
    /// Bytes to send back to the device.
    pub ack: Option<Bytes>,
}

impl Frame {
    pub fn identity(device_id: impl Into<String>) -> Self {
        Frame {
            device_id: Some(device_id.into()),
            telemetry: None,
            ack: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Codec {
    H02(H02Codec),
    Gt06(Gt06Codec),
}

impl Codec {
    pub fn protocol(&self) -> Protocol {
        match self {
            Codec::H02(_) => Protocol::H02,
            Codec::Gt06(_) => Protocol::Gt06,
        }
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self {
            Codec::H02(codec) => codec.decode(src),
            Codec::Gt06(codec) => codec.decode(src),
        }
    }
}

/// Everything one pass over a buffer produced.
#[derive(Debug, Default)]
pub struct Decoded {
    pub frames: Vec<Frame>,
    pub ack: Vec<u8>,
    pub malformed: Vec<FrameError>,
}

/// Decode every complete frame in `buf`, leaving a trailing partial frame in
/// place. Malformed frames are dropped and decoding carries on behind them.
pub fn decode_all(codec: &mut Codec, buf: &mut BytesMut) -> Decoded {
    let mut decoded = Decoded::default();

    loop {
        match codec.decode(buf) {
            Ok(Some(frame)) => {
                if let Some(ack) = &frame.ack {
                    decoded.ack.extend_from_slice(ack);
                }
                decoded.frames.push(frame);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(protocol = %codec.protocol(), error = %e, "Discarding malformed frame");
                decoded.malformed.push(e);
            }
        }
    }

    decoded
}

/// Drop everything before the first byte at or after `from` that satisfies
/// `is_marker`. Clears the buffer when there is none.
pub(crate) fn skip_to_marker(buf: &mut BytesMut, from: usize, is_marker: impl Fn(&[u8]) -> bool) {
    let from = from.min(buf.len());
    let next = (from..buf.len()).find(|&i| is_marker(&buf[i..]));
    match next {
        Some(i) => {
            let _ = buf.split_to(i);
        }
        None => buf.clear(),
    }
}

/// Decode packed BCD, two digits per byte.
pub(crate) fn bcd_digits(bytes: &[u8]) -> Option<String> {
    let mut digits = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        for nibble in [b >> 4, b & 0x0f] {
            if nibble > 9 {
                return None;
            }
            digits.push(char::from(b'0' + nibble));
        }
    }
    Some(digits)
}

pub(crate) fn bcd_value(bytes: &[u8]) -> Option<u32> {
    bcd_digits(bytes)?.parse().ok()
}
