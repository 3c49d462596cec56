// Copyright (c) 2024 The PriFi Authors

//! Byte-exact framing of downstream cells broadcast over UDP.
//!
//! ```text
//! 0      4      8                len-8        len-4        len
//! +------+------+----------------+------------+------------+
//! |round |owner |    payload     | flagResync | flagOCReq  |
//! +------+------+----------------+------------+------------+
//! ```
//!
//! Every integer is big-endian. A cell without an owner carries
//! [`NO_OWNER`] in the owner field.

use crate::error::{PrifiError, PrifiResult};

/// Ownership value of a round no client may speak in.
pub const NO_OWNER: u32 = u32::MAX;

const HEADER_LENGTH: usize = 8;
const TRAILER_LENGTH: usize = 8;

/// A `REL_CLI_DOWNSTREAM_DATA_UDP` datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownstreamDatagram {
    /// Round the cell opens
    pub round_id: u32,
    /// Slot owner of that round
    pub ownership_id: Option<u32>,
    /// Downstream payload
    pub data: Vec<u8>,
    /// Clients must go back to setup
    pub flag_resync: bool,
    /// Clients must answer with an open/closed contribution
    pub flag_open_closed_request: bool,
}

fn flag(value: bool) -> [u8; 4] {
    u32::from(value).to_be_bytes()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(word)
}

impl DownstreamDatagram {
    /// Encode the datagram.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + self.data.len() + TRAILER_LENGTH);
        out.extend_from_slice(&self.round_id.to_be_bytes());
        out.extend_from_slice(&self.ownership_id.unwrap_or(NO_OWNER).to_be_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&flag(self.flag_resync));
        out.extend_from_slice(&flag(self.flag_open_closed_request));
        out
    }

    /// Decode a datagram.
    pub fn from_bytes(bytes: &[u8]) -> PrifiResult<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(PrifiError::MalformedMessage(format!(
                "downstream datagram of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        if bytes.len() < HEADER_LENGTH + TRAILER_LENGTH {
            return Err(PrifiError::MalformedMessage(format!(
                "downstream datagram of {} bytes has no flags",
                bytes.len()
            )));
        }

        let len = bytes.len();
        let owner = read_u32(bytes, 4);
        Ok(Self {
            round_id: read_u32(bytes, 0),
            ownership_id: (owner != NO_OWNER).then_some(owner),
            data: bytes[HEADER_LENGTH..len - TRAILER_LENGTH].to_vec(),
            flag_resync: read_u32(bytes, len - 8) == 1,
            flag_open_closed_request: read_u32(bytes, len - 4) == 1,
        })
    }
}
