// Copyright (c) 2024 The PriFi Authors

//! Protocol messages exchanged between relay, clients and trustees.
//!
//! Stream transports carry [`Message`] encoded with `bincode`; downstream cells
//! broadcast over UDP use the byte-exact [`udp::DownstreamDatagram`] framing.
//! Points travel as compressed Ristretto encodings and are validated on
//! decode.

pub mod udp;

use crate::{
    config::Parameters,
    error::{PrifiError, PrifiResult},
};
use prifi_crypto::RistrettoPoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use udp::{DownstreamDatagram, NO_OWNER};

/// AES-256-CTR key and IV a client hands to the relay for its downstream
/// traffic.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DownstreamKey {
    /// AES-256 key
    pub key: [u8; 32],
    /// Initial counter block
    pub iv: [u8; 16],
}

impl fmt::Debug for DownstreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DownstreamKey([redacted])")
    }
}

/// Every message of the protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// `ALL_ALL_PARAMETERS`
    Parameters(Parameters),

    /// `ALL_ALL_SHUTDOWN`
    Shutdown,

    /// `TRU_REL_TELL_PK`
    TrusteeTellPk {
        /// Sender
        trustee_id: u32,
        /// Long-term public key
        pk: RistrettoPoint,
    },

    /// `REL_CLI_TELL_TRUSTEES_PK`
    TellTrusteesPk {
        /// Long-term keys of trustees `0..m`
        pks: Vec<RistrettoPoint>,
    },

    /// `CLI_REL_TELL_PK_AND_EPH_PK`
    ClientTellPkAndEphPk {
        /// Sender
        client_id: u32,
        /// Long-term public key
        pk: RistrettoPoint,
        /// Ephemeral public key for this session
        eph_pk: RistrettoPoint,
        /// Key for encrypted downstream traffic
        downstream_key: Option<DownstreamKey>,
    },

    /// `REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE`
    TellClientsPksAndEphPksAndBase {
        /// Long-term keys of clients `0..n`
        pks: Vec<RistrettoPoint>,
        /// Ephemeral keys as output by the previous trustee
        eph_pks: Vec<RistrettoPoint>,
        /// Base as output by the previous trustee
        base: RistrettoPoint,
    },

    /// `TRU_REL_TELL_NEW_BASE_AND_EPH_PKS`
    TrusteeTellNewBaseAndEphPks {
        /// Sender
        trustee_id: u32,
        /// `c_j * B_{j-1}`
        new_base: RistrettoPoint,
        /// Blinded and permuted keys
        new_eph_pks: Vec<RistrettoPoint>,
        /// Shuffle proof
        proof: Vec<u8>,
        /// Verifiable DC-net key, empty for the simple DC-net
        vkey: Vec<u8>,
    },

    /// `REL_TRU_TELL_TRANSCRIPT`
    TellTranscript {
        /// Base fed to the first trustee
        input_base: RistrettoPoint,
        /// Ephemeral keys fed to the first trustee
        input_eph_pks: Vec<RistrettoPoint>,
        /// Output base of every trustee
        bases: Vec<RistrettoPoint>,
        /// Output keys of every trustee
        eph_pks: Vec<Vec<RistrettoPoint>>,
        /// Proof of every trustee
        proofs: Vec<Vec<u8>>,
    },

    /// `TRU_REL_SHUFFLE_SIG`
    TrusteeShuffleSig {
        /// Sender
        trustee_id: u32,
        /// Signature over the final base and keys
        sig: Vec<u8>,
    },

    /// `REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG`
    TellEphPksAndTrusteesSig {
        /// Final base
        base: RistrettoPoint,
        /// Final slot keys
        eph_pks: Vec<RistrettoPoint>,
        /// One signature per trustee
        trustee_sigs: Vec<Vec<u8>>,
    },

    /// `CLI_REL_SHUFFLE_REJECTED`
    ClientShuffleRejected {
        /// Sender, who could not verify the shuffle or find its slot
        client_id: u32,
    },

    /// `CLI_REL_UPSTREAM_DATA`
    UpstreamData {
        /// Sender
        client_id: u32,
        /// Round of the cipher
        round_id: u32,
        /// Encoded DC-net cipher
        data: Vec<u8>,
    },

    /// `CLI_REL_OPENCLOSED_DATA`
    OpenClosedData {
        /// Sender
        client_id: u32,
        /// Round of the cipher
        round_id: u32,
        /// Encoded DC-net cipher of the bitmask contribution
        data: Vec<u8>,
    },

    /// `TRU_REL_DC_CIPHER`
    TrusteeCipher {
        /// Round of the cipher
        round_id: u32,
        /// Sender
        trustee_id: u32,
        /// Encoded DC-net cipher
        data: Vec<u8>,
    },

    /// `REL_CLI_DOWNSTREAM_DATA`
    DownstreamData {
        /// Round the cell opens
        round_id: u32,
        /// Slot owner of that round
        ownership_id: Option<u32>,
        /// Downstream payload, encrypted if enabled
        data: Vec<u8>,
        /// Clients must go back to setup
        flag_resync: bool,
        /// Clients must answer with an open/closed contribution
        flag_open_closed_request: bool,
    },

    /// `REL_TRU_TELL_RATE_CHANGE`
    RateChange {
        /// Zero asks the trustee to slow down, anything else to resume
        window_capacity: u32,
    },

    /// `CLI_REL_DISRUPTION_BLAME`
    DisruptionBlame {
        /// Complaining client
        client_id: u32,
        /// Disrupted round
        round_id: u32,
        /// Flipped bit inside the payload
        bit_pos: u32,
    },

    /// `REL_ALL_DISRUPTION_REVEAL`
    DisruptionRevealRequest {
        /// Disrupted round
        round_id: u32,
        /// Flipped bit inside the payload
        bit_pos: u32,
    },

    /// `CLI_REL_DISRUPTION_REVEAL`
    ClientDisruptionReveal {
        /// Sender
        client_id: u32,
        /// One pad bit per trustee
        bits: Vec<u8>,
    },

    /// `TRU_REL_DISRUPTION_REVEAL`
    TrusteeDisruptionReveal {
        /// Sender
        trustee_id: u32,
        /// One pad bit per client
        bits: Vec<u8>,
    },

    /// `REL_ALL_DISRUPTION_SECRET`
    DisruptionSecretRequest {
        /// Peer whose shared secret must be revealed
        peer_id: u32,
    },

    /// `CLI_REL_DISRUPTION_SECRET`
    ClientDisruptionSecret {
        /// Sender
        client_id: u32,
        /// Trustee the secret is shared with
        trustee_id: u32,
        /// Shared point
        secret: RistrettoPoint,
        /// Proof that the point derives from the sender's long-term key
        proof: Vec<u8>,
    },

    /// `TRU_REL_DISRUPTION_SECRET`
    TrusteeDisruptionSecret {
        /// Sender
        trustee_id: u32,
        /// Client the secret is shared with
        client_id: u32,
        /// Shared point
        secret: RistrettoPoint,
        /// Proof that the point derives from the sender's long-term key
        proof: Vec<u8>,
    },
}

impl Message {
    /// Protocol name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Parameters(_) => "ALL_ALL_PARAMETERS",
            Message::Shutdown => "ALL_ALL_SHUTDOWN",
            Message::TrusteeTellPk { .. } => "TRU_REL_TELL_PK",
            Message::TellTrusteesPk { .. } => "REL_CLI_TELL_TRUSTEES_PK",
            Message::ClientTellPkAndEphPk { .. } => "CLI_REL_TELL_PK_AND_EPH_PK",
            Message::TellClientsPksAndEphPksAndBase { .. } => {
                "REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE"
            }
            Message::TrusteeTellNewBaseAndEphPks { .. } => "TRU_REL_TELL_NEW_BASE_AND_EPH_PKS",
            Message::TellTranscript { .. } => "REL_TRU_TELL_TRANSCRIPT",
            Message::TrusteeShuffleSig { .. } => "TRU_REL_SHUFFLE_SIG",
            Message::TellEphPksAndTrusteesSig { .. } => "REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG",
            Message::ClientShuffleRejected { .. } => "CLI_REL_SHUFFLE_REJECTED",
            Message::UpstreamData { .. } => "CLI_REL_UPSTREAM_DATA",
            Message::OpenClosedData { .. } => "CLI_REL_OPENCLOSED_DATA",
            Message::TrusteeCipher { .. } => "TRU_REL_DC_CIPHER",
            Message::DownstreamData { .. } => "REL_CLI_DOWNSTREAM_DATA",
            Message::RateChange { .. } => "REL_TRU_TELL_RATE_CHANGE",
            Message::DisruptionBlame { .. } => "CLI_REL_DISRUPTION_BLAME",
            Message::DisruptionRevealRequest { .. } => "REL_ALL_DISRUPTION_REVEAL",
            Message::ClientDisruptionReveal { .. } => "CLI_REL_DISRUPTION_REVEAL",
            Message::TrusteeDisruptionReveal { .. } => "TRU_REL_DISRUPTION_REVEAL",
            Message::DisruptionSecretRequest { .. } => "REL_ALL_DISRUPTION_SECRET",
            Message::ClientDisruptionSecret { .. } => "CLI_REL_DISRUPTION_SECRET",
            Message::TrusteeDisruptionSecret { .. } => "TRU_REL_DISRUPTION_SECRET",
        }
    }

    /// Encode for a stream transport.
    pub fn to_bytes(&self) -> PrifiResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a message produced by [`Message::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> PrifiResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Convert a received UDP datagram into its stream counterpart.
    pub fn from_datagram(bytes: &[u8]) -> PrifiResult<Self> {
        let datagram = DownstreamDatagram::from_bytes(bytes)?;
        Ok(Message::DownstreamData {
            round_id: datagram.round_id,
            ownership_id: datagram.ownership_id,
            data: datagram.data,
            flag_resync: datagram.flag_resync,
            flag_open_closed_request: datagram.flag_open_closed_request,
        })
    }

    /// The UDP framing of a downstream cell, if this is one.
    pub fn to_datagram(&self) -> PrifiResult<Vec<u8>> {
        match self {
            Message::DownstreamData {
                round_id,
                ownership_id,
                data,
                flag_resync,
                flag_open_closed_request,
            } => Ok(DownstreamDatagram {
                round_id: *round_id,
                ownership_id: *ownership_id,
                data: data.clone(),
                flag_resync: *flag_resync,
                flag_open_closed_request: *flag_open_closed_request,
            }
            .to_bytes()),
            other => Err(PrifiError::MalformedMessage(format!(
                "{} has no datagram form",
                other.name()
            ))),
        }
    }
}
