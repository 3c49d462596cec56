// Copyright (c) 2024 The PriFi Authors

//! The DC-net.
//!
//! Client `i` and trustee `j` share a keystream seeded from `K_ij`. Every
//! round, each of them draws `P` bytes per peer and XORs them into its cipher;
//! only the slot owner also XORs in its message. Every pad appears exactly
//! twice across the `n + m` ciphers, so their XOR is the owner's message.
//!
//! ```text
//!   client 0:  msg ^ p00 ^ p01          trustee 0:  p00 ^ p10
//!   client 1:        p10 ^ p11          trustee 1:  p01 ^ p11
//!   -----------------------------------------------------------
//!   XOR of all ciphers                = msg
//! ```
//!
//! [`DcNetEntity`] implements the three roles' views of a round. The entity
//! keeps its own round counter; callers synchronize it through
//! [`DcNetEntity::encode_for_round`] and [`DcNetEntity::decode_start`].

pub mod cipher;
pub mod disruption;
pub mod downstream;
pub mod equivocation;

use crate::error::{PrifiError, PrifiResult};
pub use cipher::DcNetCipher;
use equivocation::{EquivocationProtection, RelayHistory};
use prifi_crypto::{RistrettoPoint, Scalar, SharedPrng};
use rand_core::CryptoRngCore;
use tracing::trace;

/// Which side of the DC-net an entity plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcNetRole {
    /// Holds one keystream per trustee and may own slots
    Client,
    /// Holds one keystream per client
    Trustee,
    /// Holds no keystream and combines the ciphers
    Relay,
}

#[derive(Debug)]
struct DecodeState {
    round: u32,
    buffer: Vec<u8>,
    client_tags: Vec<Vec<u8>>,
    trustee_tags: Vec<Vec<u8>>,
    history: Scalar,
}

/// One participant's DC-net state.
#[derive(Debug)]
pub struct DcNetEntity {
    role: DcNetRole,
    payload_size: usize,
    prngs: Vec<SharedPrng>,
    current_round: u32,
    equivocation: Option<EquivocationProtection>,
    relay_history: RelayHistory,
    decoding: Option<DecodeState>,
}

fn xor_into(target: &mut [u8], source: &[u8]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t ^= s;
    }
}

impl DcNetEntity {
    fn new(
        role: DcNetRole,
        payload_size: usize,
        shared_secrets: &[RistrettoPoint],
        equivocation_protection: bool,
    ) -> Self {
        Self {
            role,
            payload_size,
            prngs: shared_secrets
                .iter()
                .map(SharedPrng::from_shared_secret)
                .collect(),
            current_round: 0,
            equivocation: equivocation_protection.then(EquivocationProtection::default),
            relay_history: RelayHistory::default(),
            decoding: None,
        }
    }

    /// A client's entity, with one shared point per trustee.
    pub fn new_client(
        payload_size: usize,
        shared_secrets: &[RistrettoPoint],
        equivocation_protection: bool,
    ) -> Self {
        Self::new(
            DcNetRole::Client,
            payload_size,
            shared_secrets,
            equivocation_protection,
        )
    }

    /// A trustee's entity, with one shared point per client.
    pub fn new_trustee(
        payload_size: usize,
        shared_secrets: &[RistrettoPoint],
        equivocation_protection: bool,
    ) -> Self {
        Self::new(
            DcNetRole::Trustee,
            payload_size,
            shared_secrets,
            equivocation_protection,
        )
    }

    /// The relay's entity.
    pub fn new_relay(payload_size: usize, equivocation_protection: bool) -> Self {
        Self::new(DcNetRole::Relay, payload_size, &[], equivocation_protection)
    }

    /// Role of this entity.
    pub fn role(&self) -> DcNetRole {
        self.role
    }

    /// Payload length `P`.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Next round this entity will encode.
    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    /// Whether ciphers carry an equivocation tag.
    pub fn equivocation_enabled(&self) -> bool {
        self.equivocation.is_some()
    }

    /// Produce the cipher for `round`.
    ///
    /// Rounds skipped since the last call consume their keystream unused.
    /// `message` is only used by a client owning the slot; it is zero-padded
    /// to the payload size.
    pub fn encode_for_round<R: CryptoRngCore + ?Sized>(
        &mut self,
        round: u32,
        slot_owner: bool,
        message: &[u8],
        rng: &mut R,
    ) -> PrifiResult<Vec<u8>> {
        let owner = slot_owner && self.role == DcNetRole::Client;
        let message = if owner { message } else { &[] };
        self.encode(round, message, owner, rng)
    }

    /// Client: the cipher of a round every client writes into, such as an
    /// open/closed request. The contributions XOR together at the relay and
    /// no owner blinding is applied.
    pub fn encode_contribution<R: CryptoRngCore + ?Sized>(
        &mut self,
        round: u32,
        contribution: &[u8],
        rng: &mut R,
    ) -> PrifiResult<Vec<u8>> {
        if self.role != DcNetRole::Client {
            return Err(PrifiError::NotInitialized("client DC-net encoder"));
        }
        self.encode(round, contribution, false, rng)
    }

    fn encode<R: CryptoRngCore + ?Sized>(
        &mut self,
        round: u32,
        message: &[u8],
        blind: bool,
        rng: &mut R,
    ) -> PrifiResult<Vec<u8>> {
        if self.role == DcNetRole::Relay {
            return Err(PrifiError::NotInitialized("relay DC-net encoder"));
        }
        if round < self.current_round {
            return Err(PrifiError::EncodeInPast {
                requested: round,
                current: self.current_round,
            });
        }
        if message.len() > self.payload_size {
            return Err(PrifiError::PayloadTooLarge(message.len(), self.payload_size));
        }

        if round > self.current_round {
            let skip = u64::from(round - self.current_round) * self.payload_size as u64;
            trace!(from = self.current_round, to = round, "fast-forwarding keystreams");
            for prng in &mut self.prngs {
                prng.skip(skip);
            }
        }

        let mut payload = vec![0u8; self.payload_size];
        payload[..message.len()].copy_from_slice(message);

        let pads: Vec<Vec<u8>> = self
            .prngs
            .iter_mut()
            .map(|prng| prng.stream(self.payload_size))
            .collect();

        let equivocation_tag = self.equivocation.as_ref().map(|equivocation| match self.role {
            DcNetRole::Client => equivocation.client_encrypt(&mut payload, &pads, blind, rng),
            _ => EquivocationProtection::trustee_contribution(&pads),
        });

        for pad in &pads {
            xor_into(&mut payload, pad);
        }
        self.current_round = round + 1;

        Ok(DcNetCipher {
            equivocation_tag,
            payload,
        }
        .to_bytes())
    }

    /// Fold a received downstream cell into the client's history.
    pub fn update_history(&mut self, data: &[u8]) {
        if let Some(equivocation) = &mut self.equivocation {
            equivocation.update_history(data);
        }
    }

    /// Relay: fold downstream cell `round` into the history and remember the
    /// result for decoding that round.
    pub fn record_downstream(&mut self, round: u32, data: &[u8]) {
        if self.equivocation.is_some() {
            self.relay_history.record_downstream(round, data);
        }
    }

    /// Relay: remember the current history for a round opened without a
    /// downstream cell.
    pub fn snapshot_history(&mut self, round: u32) {
        if self.equivocation.is_some() {
            self.relay_history.snapshot(round);
        }
    }

    /// Relay: start combining the ciphers of `round`.
    pub fn decode_start(&mut self, round: u32) {
        trace!(round, "decode start");
        self.decoding = Some(DecodeState {
            round,
            buffer: vec![0u8; self.payload_size],
            client_tags: Vec::new(),
            trustee_tags: Vec::new(),
            history: self.relay_history.for_round(round),
        });
    }

    /// Round currently being decoded.
    pub fn decoding_round(&self) -> Option<u32> {
        self.decoding.as_ref().map(|state| state.round)
    }

    fn absorb(&mut self, round: u32, bytes: &[u8], from_client: bool) -> PrifiResult<()> {
        let equivocation = self.equivocation.is_some();
        let payload_size = self.payload_size;
        let state = self
            .decoding
            .as_mut()
            .ok_or(PrifiError::NotInitialized("DC-net decoder"))?;
        if state.round != round {
            return Err(PrifiError::DecodeRoundMismatch {
                started: state.round,
                got: round,
            });
        }

        let cipher = DcNetCipher::from_bytes(bytes)?;
        if cipher.payload.len() != payload_size {
            return Err(PrifiError::MalformedCipher(format!(
                "payload of {} bytes, expected {payload_size}",
                cipher.payload.len()
            )));
        }
        let tag = match (equivocation, cipher.equivocation_tag) {
            (true, Some(tag)) => Some(tag),
            (true, None) => {
                return Err(PrifiError::MalformedCipher(
                    "missing equivocation tag".to_string(),
                ))
            }
            (false, _) => None,
        };

        xor_into(&mut state.buffer, &cipher.payload);
        if let Some(tag) = tag {
            if from_client {
                state.client_tags.push(tag);
            } else {
                state.trustee_tags.push(tag);
            }
        }
        Ok(())
    }

    /// Relay: combine a client cipher of `round`.
    pub fn decode_client(&mut self, round: u32, bytes: &[u8]) -> PrifiResult<()> {
        self.absorb(round, bytes, true)
    }

    /// Relay: combine a trustee cipher of `round`.
    pub fn decode_trustee(&mut self, round: u32, bytes: &[u8]) -> PrifiResult<()> {
        self.absorb(round, bytes, false)
    }

    /// Relay: the plaintext of the round being decoded.
    pub fn decode_cell(&mut self) -> PrifiResult<Vec<u8>> {
        let mut state = self
            .decoding
            .take()
            .ok_or(PrifiError::NotInitialized("DC-net decoder"))?;
        if self.equivocation.is_some() {
            EquivocationProtection::relay_decode(
                &state.history,
                &mut state.buffer,
                &state.client_tags,
                &state.trustee_tags,
            )?;
            self.relay_history.release(state.round);
        }
        Ok(state.buffer)
    }
}
