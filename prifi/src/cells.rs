// Copyright (c) 2024 The PriFi Authors

//! Contents of decoded upstream cells.
//!
//! An owned slot carries either a data frame or a latency probe:
//!
//! ```text
//! data:    | len: u16 | data[len] | zeros ...
//! probe:   | 0xAAAA | count: u16 | (client: u16, round: u32, sent_ms: u64) * count |
//! ```
//!
//! An all-zero cell is a data frame of length zero, i.e. nothing to deliver.
//! The relay echoes probes downstream, where each client recognizes its own
//! entries and measures the round trip. A data frame of exactly `0xAAAA`
//! bytes would read as a probe, so payloads above 43691 bytes cannot use their
//! full capacity.

use crate::error::{PrifiError, PrifiResult};
use std::time::{SystemTime, UNIX_EPOCH};

/// First two bytes of a latency probe.
pub const LATENCY_PATTERN: u16 = 0xAAAA;

const FRAME_HEADER: usize = 2;
const PROBE_HEADER: usize = 4;
const PROBE_ENTRY: usize = 14;

/// One client's latency measurement request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencyProbe {
    /// Client that sent the probe
    pub client_id: u16,
    /// Round the probe was sent in
    pub round: u32,
    /// Sender's clock in milliseconds since the Unix epoch
    pub sent_ms: u64,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Whether `cell` holds latency probes.
pub fn is_latency_probe(cell: &[u8]) -> bool {
    cell.len() >= PROBE_HEADER && u16::from_be_bytes([cell[0], cell[1]]) == LATENCY_PATTERN
}

/// Encode as many `probes` as fit in `capacity` bytes.
pub fn encode_latency_probes(probes: &[LatencyProbe], capacity: usize) -> PrifiResult<Vec<u8>> {
    if capacity < PROBE_HEADER + PROBE_ENTRY {
        return Err(PrifiError::PayloadTooLarge(PROBE_HEADER + PROBE_ENTRY, capacity));
    }
    let count = probes
        .len()
        .min((capacity - PROBE_HEADER) / PROBE_ENTRY)
        .min(usize::from(u16::MAX));

    let mut out = Vec::with_capacity(PROBE_HEADER + count * PROBE_ENTRY);
    out.extend_from_slice(&LATENCY_PATTERN.to_be_bytes());
    out.extend_from_slice(&(count as u16).to_be_bytes());
    for probe in &probes[..count] {
        out.extend_from_slice(&probe.client_id.to_be_bytes());
        out.extend_from_slice(&probe.round.to_be_bytes());
        out.extend_from_slice(&probe.sent_ms.to_be_bytes());
    }
    Ok(out)
}

/// Decode the probes of a cell; `None` if it is not a probe cell.
///
/// Entries cut off by the end of the cell are dropped.
pub fn decode_latency_probes(cell: &[u8]) -> Option<Vec<LatencyProbe>> {
    if !is_latency_probe(cell) {
        return None;
    }
    let count = usize::from(u16::from_be_bytes([cell[2], cell[3]]));
    let probes = cell[PROBE_HEADER..]
        .chunks_exact(PROBE_ENTRY)
        .take(count)
        .map(|entry| {
            let mut round = [0u8; 4];
            round.copy_from_slice(&entry[2..6]);
            let mut sent_ms = [0u8; 8];
            sent_ms.copy_from_slice(&entry[6..14]);
            LatencyProbe {
                client_id: u16::from_be_bytes([entry[0], entry[1]]),
                round: u32::from_be_bytes(round),
                sent_ms: u64::from_be_bytes(sent_ms),
            }
        })
        .collect();
    Some(probes)
}

/// Downstream cell sent when the relay has nothing queued. Too short for a
/// frame or a probe, so clients deliver nothing from it.
pub const IDLE_DOWNSTREAM: [u8; 1] = [0];

/// Largest data chunk a frame of `capacity` bytes carries.
pub fn max_frame_data(capacity: usize) -> usize {
    capacity
        .saturating_sub(FRAME_HEADER)
        .min(usize::from(LATENCY_PATTERN) - 1)
}

/// Frame `data` for a slot of `capacity` bytes.
pub fn frame_data(data: &[u8], capacity: usize) -> PrifiResult<Vec<u8>> {
    if data.len() > max_frame_data(capacity) {
        return Err(PrifiError::PayloadTooLarge(data.len(), max_frame_data(capacity)));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER + data.len());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Data carried by a frame; `None` for an empty or malformed frame.
pub fn unframe_data(cell: &[u8]) -> Option<&[u8]> {
    if cell.len() < FRAME_HEADER {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([cell[0], cell[1]]));
    if len == 0 {
        return None;
    }
    cell.get(FRAME_HEADER..FRAME_HEADER + len)
}
