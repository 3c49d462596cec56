// Copyright (c) 2024 The PriFi Authors

//! Error types for the PriFi protocol core.

use displaydoc::Display;
use prifi_crypto::CryptoError;
use thiserror::Error;

/// Errors raised by the PriFi roles and their components.
///
/// Most variants are recoverable protocol errors: the offending message is
/// logged and dropped and the session continues. Variants for which
/// [`PrifiError::is_fatal`] returns `true` are logic errors that stop the role.
#[derive(Debug, Display, Error)]
pub enum PrifiError {
    /// Message {message} is not accepted in state {state}
    UnexpectedMessage {
        /// Protocol name of the rejected message
        message: &'static str,
        /// State the role was in
        state: String,
    },

    /// Cipher for round {round} is in the past, current round is {current}
    PastRound {
        /// Round the cipher was sent for
        round: u32,
        /// Smallest open round
        current: u32,
    },

    /// Refusing an empty cipher for round {0}
    EmptyCipher(u32),

    /// No round is open
    NoOpenRound,

    /// Unknown {0} id {1}
    UnknownEntity(&'static str, u32),

    /// Duplicate {0} id {1}
    DuplicateEntity(&'static str, u32),

    /// Malformed cipher: {0}
    MalformedCipher(String),

    /// Malformed message: {0}
    MalformedMessage(String),

    /// Invalid parameters: {0}
    InvalidParameters(String),

    /// Shuffle rejected: {0}
    ShuffleRejected(String),

    /// Own ephemeral key not found in the shuffle output
    SlotNotFound,

    /// Cryptographic failure: {0}
    Crypto(#[from] CryptoError),

    /// Transport failure: {0}
    Transport(String),

    /// Disruption check failed for round {0}
    DisruptionDetected(u32),

    /// Blame aborted: {0}
    Blame(String),

    /// Cannot open another round, {0} rounds are already open
    WindowFull(usize),

    /// Round {0} cannot be closed, ciphers are missing
    IncompleteRound(u32),

    /// Decoding round {got} while round {started} was started
    DecodeRoundMismatch {
        /// Round passed to the decode start
        started: u32,
        /// Round of the cipher being decoded
        got: u32,
    },

    /// Cannot encode round {requested}, the DC-net is already at round {current}
    EncodeInPast {
        /// Requested round
        requested: u32,
        /// Round the entity is at
        current: u32,
    },

    /// Message of {0} bytes exceeds the payload capacity of {1} bytes
    PayloadTooLarge(usize, usize),

    /// {0} used before setup
    NotInitialized(&'static str),

    /// Invalid rate limiter bounds: {0}
    InvalidRateLimit(&'static str),

    /// Configuration error: {0}
    Config(String),
}

impl PrifiError {
    /// Whether this error must stop the role rather than drop one message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PrifiError::WindowFull(_)
                | PrifiError::IncompleteRound(_)
                | PrifiError::DecodeRoundMismatch { .. }
                | PrifiError::EncodeInPast { .. }
                | PrifiError::PayloadTooLarge(..)
                | PrifiError::NotInitialized(_)
                | PrifiError::InvalidRateLimit(_)
                | PrifiError::NoOpenRound
        )
    }
}

impl From<bincode::Error> for PrifiError {
    fn from(err: bincode::Error) -> Self {
        PrifiError::MalformedMessage(err.to_string())
    }
}

impl From<toml::de::Error> for PrifiError {
    fn from(err: toml::de::Error) -> Self {
        PrifiError::Config(err.to_string())
    }
}

/// Result type for PriFi operations.
pub type PrifiResult<T> = Result<T, PrifiError>;
