//! Per-device ingestion state.
//!
//! [`DeviceSession`] owns everything order-sensitive for one device: the
//! decode buffer, the last accepted position and the trip segmenter. The
//! [`SessionRegistry`] hands out one shared session per device id, each
//! behind its own mutex, so reconnects of the same device serialize while
//! different devices never contend. Sessions outlive their connections: the
//! last accepted position, and with it the sequence numbering and ordering
//! checks, carry over to the next connection of the same device. A [`Link`]
//! is one transport connection: it buffers bytes until a frame names the
//! device, then forwards everything to that device's session.

use bytes::BytesMut;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::config::{Precision, TripSettings};
use crate::error::TrackerError;
use crate::normalize::normalize;
use crate::protocol::{self, Codec, Frame, Protocol};
use crate::trip::{OpenTrip, TripSegmenter};
use crate::types::{Device, Position, Trip};

static LINK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Malformed frames tolerated before a connection has identified itself.
const MAX_UNIDENTIFIED_MALFORMED: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionSettings {
    pub trip: TripSettings,
    pub precision: Precision,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub frames: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub accepted: u64,
    pub foreign: u64,
}

/// Output of one [`DeviceSession::accept`] call, in arrival order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Accepted {
    pub positions: Vec<Position>,
    pub closed: Vec<Trip>,
    pub ack: Vec<u8>,
}

impl Accepted {
    fn merge(&mut self, other: Accepted) {
        self.positions.extend(other.positions);
        self.closed.extend(other.closed);
        self.ack.extend(other.ack);
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.closed.is_empty() && self.ack.is_empty()
    }
}

#[derive(Debug)]
pub struct DeviceSession {
    device: Device,
    codec: Codec,
    buffer: BytesMut,
    buffer_owner: Option<u64>,
    last: Option<Position>,
    segmenter: TripSegmenter,
    precision: Precision,
    counters: SessionCounters,
    links: usize,
}

impl DeviceSession {
    pub fn new(device: Device, settings: SessionSettings) -> Self {
        Self::resume(device, settings, None)
    }

    /// A session that continues after `last`, the most recent position
    /// accepted for this device by an earlier session.
    pub fn resume(device: Device, settings: SessionSettings, last: Option<Position>) -> Self {
        DeviceSession {
            codec: device.protocol.codec(),
            device,
            buffer: BytesMut::new(),
            buffer_owner: None,
            last,
            segmenter: TripSegmenter::new(settings.trip, settings.precision),
            precision: settings.precision,
            counters: SessionCounters::default(),
            links: 0,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn last_position(&self) -> Option<&Position> {
        self.last.as_ref()
    }

    pub fn current_trip(&self) -> Option<&OpenTrip> {
        self.segmenter.current()
    }

    /// Connections currently bound to this session.
    pub fn links(&self) -> usize {
        self.links
    }

    /// Feed raw bytes from the device's only connection.
    pub fn accept(&mut self, raw: &[u8]) -> Accepted {
        self.accept_from(0, raw)
    }

    /// Feed raw bytes read by connection `link`. A partial frame left by a
    /// different connection cannot be completed by these bytes and is dropped.
    pub fn accept_from(&mut self, link: u64, raw: &[u8]) -> Accepted {
        if self.buffer_owner != Some(link) {
            if !self.buffer.is_empty() {
                warn!(
                    device_id = %self.device.serial,
                    bytes = self.buffer.len(),
                    "Dropping partial frame left by another connection"
                );
                self.buffer.clear();
                self.counters.malformed += 1;
            }
            self.buffer_owner = Some(link);
        }

        self.buffer.extend_from_slice(raw);
        let decoded = protocol::decode_all(&mut self.codec, &mut self.buffer);
        self.counters.malformed += decoded.malformed.len() as u64;

        let mut out = Accepted {
            ack: decoded.ack,
            ..Accepted::default()
        };
        for frame in decoded.frames {
            self.ingest(frame, &mut out);
        }
        out
    }

    /// Normalize and segment one decoded frame. Acks are the caller's job.
    pub fn ingest(&mut self, frame: Frame, out: &mut Accepted) {
        self.counters.frames += 1;

        if let Some(id) = frame.device_id.as_deref() {
            if id != self.device.serial {
                let mismatch = TrackerError::DeviceMismatch {
                    bound: self.device.serial.clone(),
                    got: id.to_string(),
                };
                warn!(error = %mismatch, "Ignoring frame");
                self.counters.foreign += 1;
                return;
            }
        }

        let Some(raw) = frame.telemetry else {
            return;
        };

        match normalize(&self.device.serial, &raw, self.last.as_ref(), &self.precision) {
            Ok(position) => {
                self.counters.accepted += 1;
                self.last = Some(position.clone());
                if let Some(closed) = self.segmenter.push(position.clone()) {
                    out.closed.push(closed);
                }
                out.positions.push(position);
            }
            Err(rejection) => {
                self.counters.rejected += 1;
                debug!(
                    device_id = %self.device.serial,
                    reason = %rejection,
                    "Rejected sample"
                );
            }
        }
    }

    /// End of the session: close any open trip and drop buffered bytes.
    pub fn close(&mut self) -> Option<Trip> {
        if !self.buffer.is_empty() {
            debug!(
                device_id = %self.device.serial,
                bytes = self.buffer.len(),
                "Discarding incomplete frame at session close"
            );
            self.buffer.clear();
        }
        self.buffer_owner = None;
        self.segmenter.close()
    }
}

pub type SharedSession = Arc<Mutex<DeviceSession>>;

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SharedSession>>,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings) -> Self {
        SessionRegistry {
            sessions: Arc::new(DashMap::new()),
            settings,
        }
    }

    /// Register a device known from storage so its numbering and ordering
    /// continue after `last`. Ignored when the device already has a session.
    pub fn restore(&self, device: Device, last: Option<Position>) {
        let settings = self.settings;
        self.sessions
            .entry(device.serial.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceSession::resume(device, settings, last))));
    }

    /// Bind one more connection to the session for `serial`, creating it
    /// (and its [`Device`]) on first sight. The device is returned only when
    /// it was just created.
    pub async fn attach(&self, serial: &str, protocol: Protocol) -> (SharedSession, Option<Device>) {
        let mut created = None;
        let session = self
            .sessions
            .entry(serial.to_string())
            .or_insert_with(|| {
                let device = Device {
                    serial: serial.to_string(),
                    protocol,
                    first_seen_at: Utc::now(),
                };
                info!(device_id = serial, protocol = %protocol, "New device session");
                created = Some(device.clone());
                Arc::new(Mutex::new(DeviceSession::new(device, self.settings)))
            })
            .value()
            .clone();

        session.lock().await.links += 1;
        (session, created)
    }

    /// A connection holding `session` went away. When it was the last one
    /// the open trip is closed and returned; the session itself stays
    /// registered for the device's next connection.
    pub async fn release(&self, serial: &str, session: SharedSession) -> Option<Trip> {
        let mut session = session.lock().await;
        session.links = session.links.saturating_sub(1);
        if session.links > 0 {
            return None;
        }

        let closed = session.close();
        info!(
            device_id = serial,
            counters = ?session.counters(),
            "Device disconnected"
        );
        closed
    }

    /// Last position accepted for `serial`, across all its connections.
    pub async fn last_position(&self, serial: &str) -> Option<Position> {
        let session = self.sessions.get(serial)?.value().clone();
        let last = session.lock().await.last_position().cloned();
        last
    }

    /// Devices with at least one live connection.
    pub async fn connected(&self) -> usize {
        let sessions: Vec<SharedSession> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut connected = 0;
        for session in sessions {
            if session.lock().await.links > 0 {
                connected += 1;
            }
        }
        connected
    }

    /// Devices seen since startup or restored from storage.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// What one read on a [`Link`] produced.
#[derive(Debug, Default)]
pub struct LinkOutput {
    /// Device created by this read.
    pub new_device: Option<Device>,
    pub device_id: Option<String>,
    pub accepted: Accepted,
}

/// One transport connection.
pub struct Link {
    id: u64,
    protocol: Protocol,
    codec: Codec,
    pending: BytesMut,
    unidentified_malformed: usize,
    bound: Option<(String, SharedSession)>,
    registry: SessionRegistry,
}

impl Link {
    pub fn new(protocol: Protocol, registry: SessionRegistry) -> Self {
        Link {
            id: LINK_COUNTER.fetch_add(1, Ordering::SeqCst),
            protocol,
            codec: protocol.codec(),
            pending: BytesMut::new(),
            unidentified_malformed: 0,
            bound: None,
            registry,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn device_id(&self) -> Option<&str> {
        self.bound.as_ref().map(|(serial, _)| serial.as_str())
    }

    pub async fn feed(&mut self, raw: &[u8]) -> Result<LinkOutput, TrackerError> {
        if let Some((serial, session)) = &self.bound {
            let accepted = session.lock().await.accept_from(self.id, raw);
            return Ok(LinkOutput {
                new_device: None,
                device_id: Some(serial.clone()),
                accepted,
            });
        }

        self.pending.extend_from_slice(raw);
        let mut early_ack = Vec::new();
        loop {
            match self.codec.decode(&mut self.pending) {
                Ok(Some(frame)) => match frame.device_id.clone() {
                    Some(serial) => return Ok(self.bind(serial, frame, early_ack).await),
                    None => {
                        if let Some(ack) = &frame.ack {
                            early_ack.extend_from_slice(ack);
                        }
                        debug!(link = self.id, protocol = %self.protocol, "Frame before identification dropped");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(link = self.id, error = %e, "Malformed frame before identification");
                    self.unidentified_malformed += 1;
                    if self.unidentified_malformed >= MAX_UNIDENTIFIED_MALFORMED {
                        return Err(TrackerError::Malformed(e));
                    }
                }
            }
        }

        Ok(LinkOutput {
            accepted: Accepted {
                ack: early_ack,
                ..Accepted::default()
            },
            ..LinkOutput::default()
        })
    }

    async fn bind(&mut self, serial: String, frame: Frame, early_ack: Vec<u8>) -> LinkOutput {
        let (session, new_device) = self.registry.attach(&serial, self.protocol).await;

        let mut accepted = Accepted {
            ack: early_ack,
            ..Accepted::default()
        };
        {
            let mut guard = session.lock().await;
            if let Some(ack) = &frame.ack {
                accepted.ack.extend_from_slice(ack);
            }
            guard.ingest(frame, &mut accepted);
            let rest = self.pending.split();
            accepted.merge(guard.accept_from(self.id, &rest));
        }

        info!(link = self.id, device_id = %serial, protocol = %self.protocol, "Connection identified");
        self.bound = Some((serial.clone(), session));
        LinkOutput {
            new_device,
            device_id: Some(serial),
            accepted,
        }
    }

    /// Connection closed: releases the device session, returning the trip
    /// that closing it finished.
    pub async fn close(mut self) -> Option<Trip> {
        let (serial, session) = self.bound.take()?;
        self.registry.release(&serial, session).await
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("device_id", &self.device_id())
            .finish()
    }
}
