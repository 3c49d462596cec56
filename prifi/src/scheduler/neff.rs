// Copyright (c) 2024 The PriFi Authors

//! The Neff shuffle of ephemeral keys, seen from each role.
//!
//! ```text
//!  relay                    trustee 0          trustee 1        clients
//!    | (G, E)  ------------->  |                   |
//!    |  <-------- (B0, K0, pi0)                    |
//!    | (B0, K0) --------------------------------->  |
//!    |  <----------------------------- (B1, K1, pi1)
//!    | transcript ----------->  | ---------------->  |
//!    |  <------- sig0 ----------  <------ sig1 -----  |
//!    | (B1, K1, sig0, sig1) ------------------------------------> slot
//! ```
//!
//! Slot `s` belongs to the client whose `priv * B_m` equals `K_m[s]`.

use crate::{
    error::{PrifiError, PrifiResult},
    messages::Message,
};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use prifi_crypto::{
    point_to_bytes, schnorr,
    shuffle::{self, Shuffle},
    PrivateKey, RistrettoPoint, ShuffleProof,
};
use rand_core::CryptoRngCore;
use tracing::debug;

/// Bytes the trustees sign: `bytes(B) || bytes(K[0]) || ... || bytes(K[n-1])`.
pub fn signed_blob(base: &RistrettoPoint, keys: &[RistrettoPoint]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 * (keys.len() + 1));
    blob.extend_from_slice(&point_to_bytes(base));
    for key in keys {
        blob.extend_from_slice(&point_to_bytes(key));
    }
    blob
}

/// The relay's side: sequences the trustees and collects their signatures.
#[derive(Debug)]
pub struct RelayShuffleView {
    n_trustees: usize,
    input_base: RistrettoPoint,
    input_keys: Vec<RistrettoPoint>,
    bases: Vec<RistrettoPoint>,
    eph_pks: Vec<Vec<RistrettoPoint>>,
    proofs: Vec<Vec<u8>>,
    signatures: Vec<Option<Vec<u8>>>,
}

impl RelayShuffleView {
    /// Start a shuffle of the clients' ephemeral keys, in client order.
    pub fn new(n_trustees: usize, input_keys: Vec<RistrettoPoint>) -> PrifiResult<Self> {
        if input_keys.is_empty() {
            return Err(PrifiError::ShuffleRejected("no ephemeral keys to shuffle".into()));
        }
        if n_trustees == 0 {
            return Err(PrifiError::ShuffleRejected("no trustee to shuffle".into()));
        }
        Ok(Self {
            n_trustees,
            input_base: RISTRETTO_BASEPOINT_POINT,
            input_keys,
            bases: Vec::with_capacity(n_trustees),
            eph_pks: Vec::with_capacity(n_trustees),
            proofs: Vec::with_capacity(n_trustees),
            signatures: vec![None; n_trustees],
        })
    }

    /// Trustee whose shuffle is awaited, if any.
    pub fn current_trustee(&self) -> Option<u32> {
        (self.bases.len() < self.n_trustees).then_some(self.bases.len() as u32)
    }

    /// Base and keys the next trustee shuffles.
    pub fn next_input(&self) -> (RistrettoPoint, Vec<RistrettoPoint>) {
        match (self.bases.last(), self.eph_pks.last()) {
            (Some(base), Some(keys)) => (*base, keys.clone()),
            _ => (self.input_base, self.input_keys.clone()),
        }
    }

    /// Record a trustee's shuffle. Returns whether every trustee shuffled.
    pub fn received_shuffle(
        &mut self,
        trustee_id: u32,
        base: RistrettoPoint,
        keys: Vec<RistrettoPoint>,
        proof: Vec<u8>,
    ) -> PrifiResult<bool> {
        match self.current_trustee() {
            Some(expected) if expected == trustee_id => {}
            expected => {
                return Err(PrifiError::ShuffleRejected(format!(
                    "shuffle from trustee {trustee_id}, expected {expected:?}"
                )))
            }
        }
        if keys.len() != self.input_keys.len() {
            return Err(PrifiError::ShuffleRejected(format!(
                "{} keys in shuffle, expected {}",
                keys.len(),
                self.input_keys.len()
            )));
        }

        self.bases.push(base);
        self.eph_pks.push(keys);
        self.proofs.push(proof);
        debug!(trustee_id, "shuffle recorded");
        Ok(self.current_trustee().is_none())
    }

    /// `REL_TRU_TELL_TRANSCRIPT`
    pub fn transcript(&self) -> Message {
        Message::TellTranscript {
            input_base: self.input_base,
            input_eph_pks: self.input_keys.clone(),
            bases: self.bases.clone(),
            eph_pks: self.eph_pks.clone(),
            proofs: self.proofs.clone(),
        }
    }

    fn final_output(&self) -> PrifiResult<(&RistrettoPoint, &[RistrettoPoint])> {
        match (self.current_trustee(), self.bases.last(), self.eph_pks.last()) {
            (None, Some(base), Some(keys)) => Ok((base, keys)),
            _ => Err(PrifiError::ShuffleRejected("shuffle not finished".into())),
        }
    }

    /// Final slot keys, once every trustee shuffled.
    pub fn final_keys(&self) -> Option<&[RistrettoPoint]> {
        self.final_output().ok().map(|(_, keys)| keys)
    }

    /// Check and record a trustee's signature. Returns whether every trustee
    /// signed.
    pub fn received_signature(
        &mut self,
        trustee_id: u32,
        signature: Vec<u8>,
        trustee_pk: &RistrettoPoint,
    ) -> PrifiResult<bool> {
        let blob = {
            let (base, keys) = self.final_output()?;
            signed_blob(base, keys)
        };
        schnorr::verify_bytes(trustee_pk, &blob, &signature)?;

        let slot = self
            .signatures
            .get_mut(trustee_id as usize)
            .ok_or(PrifiError::UnknownEntity("trustee", trustee_id))?;
        if slot.is_some() {
            return Err(PrifiError::DuplicateEntity("trustee signature", trustee_id));
        }
        *slot = Some(signature);
        Ok(self.signatures.iter().all(Option::is_some))
    }

    /// `REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG`
    pub fn final_message(&self) -> PrifiResult<Message> {
        let (base, keys) = self.final_output()?;
        let trustee_sigs = self
            .signatures
            .iter()
            .map(|sig| {
                sig.clone()
                    .ok_or_else(|| PrifiError::ShuffleRejected("missing trustee signature".into()))
            })
            .collect::<PrifiResult<Vec<_>>>()?;
        Ok(Message::TellEphPksAndTrusteesSig {
            base: *base,
            eph_pks: keys.to_vec(),
            trustee_sigs,
        })
    }
}

/// A trustee's side: its own shuffle, kept to find it in the transcript.
#[derive(Debug, Default)]
pub struct TrusteeShuffleView {
    own: Option<(RistrettoPoint, Vec<RistrettoPoint>, Vec<u8>)>,
}

impl TrusteeShuffleView {
    /// Shuffle `(base, keys)` and return `(new_base, new_keys, proof)`.
    pub fn shuffle<R: CryptoRngCore + ?Sized>(
        &mut self,
        base: &RistrettoPoint,
        keys: &[RistrettoPoint],
        rng: &mut R,
    ) -> PrifiResult<(RistrettoPoint, Vec<RistrettoPoint>, Vec<u8>)> {
        let (output, _blinding) = shuffle::shuffle(base, keys, rng)?;
        let proof = output.proof.to_bytes()?;
        let result = (output.base, output.keys, proof);
        self.own = Some(result.clone());
        Ok(result)
    }

    /// Verify every shuffle of the transcript, check ours is in it unchanged,
    /// and sign the final base and keys.
    #[allow(clippy::too_many_arguments)]
    pub fn verify_transcript_and_sign<R: CryptoRngCore + ?Sized>(
        &self,
        private_key: &PrivateKey,
        input_base: &RistrettoPoint,
        input_keys: &[RistrettoPoint],
        bases: &[RistrettoPoint],
        eph_pks: &[Vec<RistrettoPoint>],
        proofs: &[Vec<u8>],
        rng: &mut R,
    ) -> PrifiResult<Vec<u8>> {
        let (own_base, own_keys, own_proof) = self
            .own
            .as_ref()
            .ok_or(PrifiError::NotInitialized("trustee shuffle"))?;
        if bases.is_empty() || bases.len() != eph_pks.len() || bases.len() != proofs.len() {
            return Err(PrifiError::ShuffleRejected(format!(
                "transcript sizes differ: {} bases, {} key lists, {} proofs",
                bases.len(),
                eph_pks.len(),
                proofs.len()
            )));
        }

        let mut previous_base = input_base;
        let mut previous_keys = input_keys;
        for (j, ((base, keys), proof)) in bases.iter().zip(eph_pks).zip(proofs).enumerate() {
            let step = Shuffle {
                base: *base,
                keys: keys.clone(),
                proof: ShuffleProof::from_bytes(proof)?,
            };
            shuffle::verify(previous_base, previous_keys, &step).map_err(|e| {
                PrifiError::ShuffleRejected(format!("shuffle {j} does not verify: {e}"))
            })?;
            previous_base = base;
            previous_keys = keys.as_slice();
        }

        let found = bases
            .iter()
            .zip(eph_pks)
            .zip(proofs)
            .any(|((base, keys), proof)| base == own_base && keys == own_keys && proof == own_proof);
        if !found {
            return Err(PrifiError::ShuffleRejected(
                "own shuffle missing from the transcript".into(),
            ));
        }

        let blob = signed_blob(previous_base, previous_keys);
        Ok(schnorr::sign(private_key, &blob, rng).to_bytes().to_vec())
    }
}

/// A client's side: check the trustees' signatures and find its slot.
pub fn recognize_slot(
    ephemeral_key: &PrivateKey,
    trustee_pks: &[RistrettoPoint],
    base: &RistrettoPoint,
    keys: &[RistrettoPoint],
    signatures: &[Vec<u8>],
) -> PrifiResult<u32> {
    if keys.is_empty() {
        return Err(PrifiError::ShuffleRejected("no slot keys".into()));
    }
    if signatures.len() != trustee_pks.len() {
        return Err(PrifiError::ShuffleRejected(format!(
            "{} signatures for {} trustees",
            signatures.len(),
            trustee_pks.len()
        )));
    }

    let blob = signed_blob(base, keys);
    for (pk, signature) in trustee_pks.iter().zip(signatures) {
        schnorr::verify_bytes(pk, &blob, signature)?;
    }

    let mine = ephemeral_key.diffie_hellman(base);
    keys.iter()
        .position(|key| *key == mine)
        .map(|slot| slot as u32)
        .ok_or(PrifiError::SlotNotFound)
}
