// Copyright (c) 2024 The PriFi Authors

//! Disruption protection.
//!
//! A slot owner prefixes its cell with an HMAC keyed by its slot key (its
//! entry in the shuffled key list), so the relay notices when somebody else
//! flipped bits in the slot. Finding the disruptor replays the pads of the
//! disrupted round bit by bit from the per-pair keystreams.

use crate::error::{PrifiError, PrifiResult};
use hmac::{
    digest::{generic_array::GenericArray, KeyInit},
    Hmac, Mac,
};
use prifi_crypto::{
    dleq::DleqProof, point_to_bytes, PrivateKey, RistrettoPoint, SharedPrng,
};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use rand_core::CryptoRngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the authentication tag at the front of an owned cell.
pub const SLOT_TAG_LENGTH: usize = 32;

fn slot_mac(slot_key: &RistrettoPoint, round: u32, body: &[u8]) -> HmacSha256 {
    // HMAC zero-pads short keys to the block size.
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(&point_to_bytes(slot_key));
    let mut mac = <HmacSha256 as KeyInit>::new(GenericArray::from_slice(&key));
    mac.update(&round.to_be_bytes());
    mac.update(body);
    mac
}

/// Prefix `body` with the slot tag for `round`.
pub fn seal(slot_key: &RistrettoPoint, round: u32, body: &[u8]) -> Vec<u8> {
    let tag = slot_mac(slot_key, round, body).finalize().into_bytes();
    let mut out = Vec::with_capacity(SLOT_TAG_LENGTH + body.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(body);
    out
}

/// Check the slot tag of a decoded cell and return the body.
pub fn open(slot_key: &RistrettoPoint, round: u32, cell: &[u8]) -> PrifiResult<Vec<u8>> {
    if cell.len() < SLOT_TAG_LENGTH {
        return Err(PrifiError::DisruptionDetected(round));
    }
    let (tag, body) = cell.split_at(SLOT_TAG_LENGTH);
    slot_mac(slot_key, round, body)
        .verify_slice(tag)
        .map_err(|_| PrifiError::DisruptionDetected(round))?;
    Ok(body.to_vec())
}

/// Value of bit `bit_pos` of the pad drawn for `round` from `secret`.
///
/// Bits are numbered from the least significant bit of the first byte.
pub fn pad_bit(secret: &RistrettoPoint, round: u32, payload_size: usize, bit_pos: u32) -> u8 {
    let byte_index = u64::from(bit_pos / 8);
    let offset = u64::from(round) * payload_size as u64 + byte_index;
    let mut prng = SharedPrng::at_offset(secret, offset);
    let byte = prng.stream(1)[0];
    (byte >> (bit_pos % 8)) & 1
}

/// One revealed bit per shared secret.
pub fn reveal_bits(
    secrets: &[RistrettoPoint],
    round: u32,
    payload_size: usize,
    bit_pos: u32,
) -> Vec<u8> {
    secrets
        .iter()
        .map(|secret| pad_bit(secret, round, payload_size, bit_pos))
        .collect()
}

/// First `(client, trustee)` pair whose revealed bits disagree.
///
/// `client_bits[i][j]` is client `i`'s bit for trustee `j` and
/// `trustee_bits[j][i]` trustee `j`'s bit for client `i`.
pub fn find_mismatch(client_bits: &[Vec<u8>], trustee_bits: &[Vec<u8>]) -> Option<(u32, u32)> {
    for (client, bits) in client_bits.iter().enumerate() {
        for (trustee, other) in trustee_bits.iter().enumerate() {
            if bits.get(trustee) != other.get(client) {
                return Some((client as u32, trustee as u32));
            }
        }
    }
    None
}

/// Reveal the point shared with `peer` and prove it derives from `private`.
pub fn reveal_shared_secret<R: CryptoRngCore + ?Sized>(
    private: &PrivateKey,
    peer: &RistrettoPoint,
    rng: &mut R,
) -> (RistrettoPoint, Vec<u8>) {
    let secret = private.diffie_hellman(peer);
    let proof = DleqProof::prove(private.as_scalar(), &RISTRETTO_BASEPOINT_POINT, peer, rng);
    (secret, proof.to_bytes().to_vec())
}

/// Check that `secret` is `owner`'s private key applied to `peer`.
pub fn verify_shared_secret(
    owner: &RistrettoPoint,
    peer: &RistrettoPoint,
    secret: &RistrettoPoint,
    proof: &[u8],
) -> PrifiResult<()> {
    DleqProof::from_bytes(proof)?.verify(&RISTRETTO_BASEPOINT_POINT, peer, owner, secret)?;
    Ok(())
}
