//! Replay of recorded device logs through the live ingestion path.
//!
//! One line is one transport read. Lines starting with `hex:` carry binary
//! frames as hex digits; any other line is fed as-is, without its newline.
//! Blank lines and `#` comments are skipped.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

use crate::dispatch::DispatchHandle;
use crate::protocol::Protocol;
use crate::session::{Link, SessionRegistry};

const HEX_PREFIX: &str = "hex:";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub lines: usize,
    pub bad_lines: usize,
    pub device_id: Option<String>,
    pub positions: usize,
    pub trips: usize,
}

fn decode_hex(digits: &str) -> Option<Vec<u8>> {
    let digits: String = digits.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Bytes carried by one log line, `None` for lines to skip.
pub fn parse_line(line: &str) -> Option<Result<Vec<u8>, String>> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() || trimmed.starts_with('#') {
        return None;
    }
    match trimmed.strip_prefix(HEX_PREFIX) {
        Some(digits) => Some(decode_hex(digits).ok_or_else(|| format!("bad hex line: {trimmed}"))),
        None => Some(Ok(trimmed.as_bytes().to_vec())),
    }
}

/// Feed every read in `path` to one connection, then close it so the open
/// trip is finished.
pub async fn replay_file(
    path: impl AsRef<Path>,
    protocol: Protocol,
    registry: &SessionRegistry,
    dispatch: &DispatchHandle,
) -> Result<ReplayReport> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening replay log {}", path.display()))?;
    info!(file = %path.display(), protocol = %protocol, "Replaying device log");

    let mut link = Link::new(protocol, registry.clone());
    let mut report = ReplayReport::default();

    for line in BufReader::new(file).lines() {
        let bytes = match parse_line(&line?) {
            None => continue,
            Some(Ok(bytes)) => bytes,
            Some(Err(reason)) => {
                warn!(reason = %reason, "Skipping replay line");
                report.bad_lines += 1;
                continue;
            }
        };
        report.lines += 1;

        let mut output = link.feed(&bytes).await?;
        report.positions += output.accepted.positions.len();
        report.trips += output.accepted.closed.len();
        dispatch.forward(&mut output);
    }

    report.device_id = link.device_id().map(str::to_string);
    if let Some(trip) = link.close().await {
        report.trips += 1;
        dispatch.submit_trip(trip);
    }
    info!(?report, "Replay finished");
    Ok(report)
}
