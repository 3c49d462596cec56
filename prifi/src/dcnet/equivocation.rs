// Copyright (c) 2024 The PriFi Authors

//! Equivocation protection.
//!
//! The relay could send different downstream cells to different clients and
//! link them to their upstream traffic. Every participant therefore folds the
//! downstream cells it saw into a history scalar `h` and binds its cipher to
//! it:
//!
//! ```text
//! client i:   theta_i = h * sum_j H(pad_ij)
//!             owner:     tag = k + theta_i, payload ^= bytes(k)
//!             non-owner: tag = theta_i
//! trustee j:  tag = sum_i H(pad_ij)
//! relay:      k = sum_i tag_i - h * sum_j tag_j
//! ```
//!
//! `k` only comes out right when every client used the relay's `h`.

use crate::error::{PrifiError, PrifiResult};
use prifi_crypto::{hash::hash_parts_to_scalar, hash::hash_to_scalar, scalar_from_bytes, Scalar};
use rand_core::CryptoRngCore;
use std::collections::BTreeMap;

/// Running hash of the downstream cells seen so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EquivocationProtection {
    history: Scalar,
}

impl Default for EquivocationProtection {
    fn default() -> Self {
        Self {
            history: Scalar::ONE,
        }
    }
}

fn xor_cyclic(payload: &mut [u8], key: &[u8; 32]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}

fn sum_of_pad_hashes(pads: &[Vec<u8>]) -> Scalar {
    pads.iter().map(|pad| hash_to_scalar(pad)).sum()
}

fn sum_of_tags(tags: &[Vec<u8>]) -> PrifiResult<Scalar> {
    tags.iter()
        .map(|tag| scalar_from_bytes(tag).map_err(PrifiError::from))
        .sum()
}

impl EquivocationProtection {
    /// The current history scalar.
    pub fn history(&self) -> Scalar {
        self.history
    }

    /// `h <- H(bytes(h) || data)`
    pub fn update_history(&mut self, data: &[u8]) {
        self.history = hash_parts_to_scalar(&[self.history.as_bytes(), data]);
    }

    /// Client side: blind the owner's payload and return the tag.
    ///
    /// `payload` is the unmasked cell content (zeros for a non-owner) and
    /// `pads` the keystream bytes drawn for this round, one per trustee.
    pub fn client_encrypt<R: CryptoRngCore + ?Sized>(
        &self,
        payload: &mut [u8],
        pads: &[Vec<u8>],
        owner: bool,
        rng: &mut R,
    ) -> Vec<u8> {
        let theta = sum_of_pad_hashes(pads) * self.history;
        if owner {
            let blind = Scalar::random(rng);
            xor_cyclic(payload, blind.as_bytes());
            (blind + theta).to_bytes().to_vec()
        } else {
            theta.to_bytes().to_vec()
        }
    }

    /// Trustee side: the tag for pads shared with every client.
    pub fn trustee_contribution(pads: &[Vec<u8>]) -> Vec<u8> {
        sum_of_pad_hashes(pads).to_bytes().to_vec()
    }

    /// Relay side: recover the owner's blinding and strip it from `payload`.
    pub fn relay_decode(
        history: &Scalar,
        payload: &mut [u8],
        client_tags: &[Vec<u8>],
        trustee_tags: &[Vec<u8>],
    ) -> PrifiResult<()> {
        let clients = sum_of_tags(client_tags)?;
        let trustees = sum_of_tags(trustee_tags)?;
        let blind = clients - trustees * history;
        xor_cyclic(payload, blind.as_bytes());
        Ok(())
    }
}

/// The relay's history, with one snapshot per round it opened.
///
/// Round `r` is decoded with the history the relay held right after sending
/// downstream cell `r`, which is what the clients bound their ciphers to, even
/// if later cells were sent before the round closed.
#[derive(Clone, Debug, Default)]
pub struct RelayHistory {
    current: EquivocationProtection,
    snapshots: BTreeMap<u32, Scalar>,
}

impl RelayHistory {
    /// Remember the current history for a round opened without a downstream
    /// cell.
    pub fn snapshot(&mut self, round: u32) {
        self.snapshots.insert(round, self.current.history());
    }

    /// Absorb downstream cell `round` and snapshot the result.
    pub fn record_downstream(&mut self, round: u32, data: &[u8]) {
        self.current.update_history(data);
        self.snapshot(round);
    }

    /// History to decode `round` with.
    pub fn for_round(&self, round: u32) -> Scalar {
        self.snapshots
            .get(&round)
            .copied()
            .unwrap_or_else(|| self.current.history())
    }

    /// Forget the snapshots of closed rounds.
    pub fn release(&mut self, round: u32) {
        self.snapshots.retain(|&r, _| r > round);
    }
}
