// Copyright (c) 2024 The PriFi Authors

//! Errors raised by the PriFi cryptographic primitives.

use displaydoc::Display;
use thiserror::Error;

/// An error which can occur while decoding keys or checking signatures and
/// proofs.
#[derive(Clone, Debug, Display, Error, Eq, PartialEq)]
pub enum CryptoError {
    /// Invalid curve point encoding
    InvalidPoint,

    /// Invalid scalar encoding
    InvalidScalar,

    /// Incorrect length, provided `{0}`, required `{1}`
    LengthMismatch(usize, usize),

    /// The signature was not able to be validated
    InvalidSignature,

    /// The discrete-log equality proof was not able to be validated
    InvalidDleqProof,

    /// Shuffle proof rejected: {0}
    InvalidShuffle(&'static str),

    /// Cannot shuffle an empty key array
    EmptyKeyArray,

    /// Failed to encode or decode a proof: {0}
    Serialization(String),
}

impl From<bincode::Error> for CryptoError {
    fn from(err: bincode::Error) -> Self {
        CryptoError::Serialization(err.to_string())
    }
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
