// Copyright (c) 2024 The PriFi Authors

//! Wire format of a DC-net cipher.
//!
//! ```text
//! 0          4          8             off_payload      end
//! +----------+----------+-------------+----------------+
//! | off_tag  | off_pay  | equiv. tag  |    payload     |
//! +----------+----------+-------------+----------------+
//! ```
//!
//! Offsets are big-endian. An absent tag has offset [`ABSENT`]; parsers only
//! follow the offsets they know, so new optional fields can be inserted
//! before the payload.

use crate::error::{PrifiError, PrifiResult};

/// Offset marking an absent field.
pub const ABSENT: u32 = u32::MAX;

const HEADER_LENGTH: usize = 8;

/// A parsed DC-net cipher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DcNetCipher {
    /// Equivocation-protection tag, a canonical scalar encoding
    pub equivocation_tag: Option<Vec<u8>>,
    /// Masked payload
    pub payload: Vec<u8>,
}

fn read_offset(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(word)
}

impl DcNetCipher {
    /// Encode the cipher.
    pub fn to_bytes(&self) -> Vec<u8> {
        let tag_length = self.equivocation_tag.as_ref().map_or(0, Vec::len);
        let tag_offset = if self.equivocation_tag.is_some() {
            HEADER_LENGTH as u32
        } else {
            ABSENT
        };
        let payload_offset = (HEADER_LENGTH + tag_length) as u32;

        let mut out = Vec::with_capacity(HEADER_LENGTH + tag_length + self.payload.len());
        out.extend_from_slice(&tag_offset.to_be_bytes());
        out.extend_from_slice(&payload_offset.to_be_bytes());
        if let Some(tag) = &self.equivocation_tag {
            out.extend_from_slice(tag);
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a cipher, checking that every offset stays inside `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> PrifiResult<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(PrifiError::MalformedCipher(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }

        let tag_offset = read_offset(bytes, 0);
        let payload_offset = read_offset(bytes, 4) as usize;
        if payload_offset < HEADER_LENGTH || payload_offset > bytes.len() {
            return Err(PrifiError::MalformedCipher(format!(
                "payload offset {payload_offset} outside of {} bytes",
                bytes.len()
            )));
        }

        let equivocation_tag = if tag_offset == ABSENT {
            None
        } else {
            let tag_offset = tag_offset as usize;
            if tag_offset < HEADER_LENGTH || tag_offset > payload_offset {
                return Err(PrifiError::MalformedCipher(format!(
                    "tag offset {tag_offset} outside of the header and payload"
                )));
            }
            Some(bytes[tag_offset..payload_offset].to_vec())
        };

        Ok(Self {
            equivocation_tag,
            payload: bytes[payload_offset..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_without_tag() {
        let cipher = DcNetCipher {
            equivocation_tag: None,
            payload: b"abcd".to_vec(),
        };

        let bytes = cipher.to_bytes();
        assert_eq!(&bytes[..4], &[0xFF; 4]);
        assert_eq!(&bytes[4..8], &8u32.to_be_bytes());
        assert_eq!(DcNetCipher::from_bytes(&bytes).unwrap(), cipher);
    }

    #[test]
    fn test_cipher_with_tag() {
        let cipher = DcNetCipher {
            equivocation_tag: Some(vec![5; 32]),
            payload: vec![1, 2, 3],
        };

        let bytes = cipher.to_bytes();
        assert_eq!(&bytes[..4], &8u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &40u32.to_be_bytes());
        assert_eq!(bytes.len(), 43);
        assert_eq!(DcNetCipher::from_bytes(&bytes).unwrap(), cipher);
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let cipher = DcNetCipher::default();
        assert_eq!(DcNetCipher::from_bytes(&cipher.to_bytes()).unwrap(), cipher);
    }

    #[test]
    fn test_bad_offsets_are_rejected() {
        assert!(DcNetCipher::from_bytes(&[0; 7]).is_err());

        let mut bytes = DcNetCipher {
            equivocation_tag: Some(vec![1; 4]),
            payload: vec![0; 4],
        }
        .to_bytes();
        bytes[4..8].copy_from_slice(&100u32.to_be_bytes());
        assert!(DcNetCipher::from_bytes(&bytes).is_err());

        bytes[4..8].copy_from_slice(&12u32.to_be_bytes());
        bytes[0..4].copy_from_slice(&14u32.to_be_bytes());
        assert!(DcNetCipher::from_bytes(&bytes).is_err());
    }
}
