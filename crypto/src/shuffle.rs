// Copyright (c) 2024 The PriFi Authors

//! Verifiable shuffle of ephemeral public keys.
//!
//! Each trustee takes a base `B` and keys `K_0..K_{n-1}`, picks a secret
//! blinding factor `c` and a secret permutation `pi`, and outputs
//! `(c*B, [c*K_pi(0), ..., c*K_pi(n-1)])`. A client holding `e` with `E = e*G`
//! recognizes `e*(c*B)` in the output while nobody else can link input and
//! output positions.
//!
//! # Proof
//!
//! The proof is a cut-and-choose shadow mix. For every round the prover
//! commits to an independent shadow shuffle `(f*B, [f*K_sigma(i)])`. A
//! Fiat-Shamir challenge bit per round, drawn from a `merlin` transcript over
//! the statement and every commitment, asks the prover to open either
//!
//! - the input-to-shadow link `(f, sigma)`, or
//! - the shadow-to-output link `(c/f, tau)` with `tau = sigma^-1 o pi`.
//!
//! A cheating shuffle survives a round with probability 1/2, so
//! [`SHUFFLE_PROOF_ROUNDS`] rounds bound the soundness error by
//! `2^-SHUFFLE_PROOF_ROUNDS`. Each opening reveals one side of a fresh random
//! shadow only, which leaks nothing about `(c, pi)`.

use crate::error::{CryptoError, CryptoResult};
use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use merlin::Transcript;
use rand::seq::SliceRandom;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Number of shadow shuffles in a proof.
pub const SHUFFLE_PROOF_ROUNDS: usize = 80;

/// Commitment to one shadow shuffle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ShadowCommitment {
    base: CompressedRistretto,
    keys: Vec<CompressedRistretto>,
}

/// Opening of one shadow shuffle, selected by its challenge bit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum ShadowOpening {
    /// `shadow.keys[i] = factor * input[permutation[i]]`
    FromInput { factor: Scalar, permutation: Vec<u32> },
    /// `output[i] = factor * shadow.keys[permutation[i]]`
    ToOutput { factor: Scalar, permutation: Vec<u32> },
}

/// Non-interactive proof that a shuffle output is a blinded permutation of
/// its input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleProof {
    shadows: Vec<ShadowCommitment>,
    openings: Vec<ShadowOpening>,
}

impl ShuffleProof {
    /// Encode the proof as opaque bytes for the wire.
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a proof produced by [`ShuffleProof::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// The public output of one trustee's shuffle step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shuffle {
    /// `c * B_in`
    pub base: RistrettoPoint,
    /// Blinded and permuted keys.
    pub keys: Vec<RistrettoPoint>,
    /// Proof binding this output to its input.
    pub proof: ShuffleProof,
}

fn random_nonzero_scalar<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Scalar {
    loop {
        let scalar = Scalar::random(rng);
        if scalar != Scalar::ZERO {
            return scalar;
        }
    }
}

fn random_permutation<R: CryptoRngCore + ?Sized>(n: usize, rng: &mut R) -> Vec<u32> {
    let mut permutation: Vec<u32> = (0..n as u32).collect();
    permutation.shuffle(rng);
    permutation
}

fn challenge_bits(
    input_base: &RistrettoPoint,
    input_keys: &[RistrettoPoint],
    output_base: &RistrettoPoint,
    output_keys: &[RistrettoPoint],
    shadows: &[ShadowCommitment],
) -> Vec<bool> {
    let mut transcript = Transcript::new(b"prifi-shuffle-v1");
    transcript.append_u64(b"n", input_keys.len() as u64);
    transcript.append_message(b"input-base", input_base.compress().as_bytes());
    for key in input_keys {
        transcript.append_message(b"input-key", key.compress().as_bytes());
    }
    transcript.append_message(b"output-base", output_base.compress().as_bytes());
    for key in output_keys {
        transcript.append_message(b"output-key", key.compress().as_bytes());
    }
    for shadow in shadows {
        transcript.append_message(b"shadow-base", shadow.base.as_bytes());
        for key in &shadow.keys {
            transcript.append_message(b"shadow-key", key.as_bytes());
        }
    }

    let mut bytes = vec![0u8; shadows.len().div_ceil(8)];
    transcript.challenge_bytes(b"bits", &mut bytes);
    (0..shadows.len())
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

fn check_permutation(permutation: &[u32], n: usize) -> CryptoResult<()> {
    if permutation.len() != n {
        return Err(CryptoError::InvalidShuffle("permutation has the wrong length"));
    }
    let mut seen = vec![false; n];
    for &index in permutation {
        let slot = seen
            .get_mut(index as usize)
            .ok_or(CryptoError::InvalidShuffle("permutation index out of range"))?;
        if *slot {
            return Err(CryptoError::InvalidShuffle("permutation repeats an index"));
        }
        *slot = true;
    }
    Ok(())
}

fn decompress(point: &CompressedRistretto) -> CryptoResult<RistrettoPoint> {
    point.decompress().ok_or(CryptoError::InvalidPoint)
}

/// Perform one trustee's shuffle step. Returns the public output and the
/// secret blinding factor `c`.
pub fn shuffle<R: CryptoRngCore + ?Sized>(
    base: &RistrettoPoint,
    keys: &[RistrettoPoint],
    rng: &mut R,
) -> CryptoResult<(Shuffle, Scalar)> {
    let n = keys.len();
    if n == 0 {
        return Err(CryptoError::EmptyKeyArray);
    }

    let blinding = random_nonzero_scalar(rng);
    let pi = random_permutation(n, rng);
    let output_base = base * blinding;
    let output_keys: Vec<RistrettoPoint> = pi.iter().map(|&i| keys[i as usize] * blinding).collect();

    let mut secrets = Vec::with_capacity(SHUFFLE_PROOF_ROUNDS);
    let mut shadows = Vec::with_capacity(SHUFFLE_PROOF_ROUNDS);
    for _ in 0..SHUFFLE_PROOF_ROUNDS {
        let factor = random_nonzero_scalar(rng);
        let sigma = random_permutation(n, rng);
        shadows.push(ShadowCommitment {
            base: (base * factor).compress(),
            keys: sigma
                .iter()
                .map(|&i| (keys[i as usize] * factor).compress())
                .collect(),
        });
        secrets.push((factor, sigma));
    }

    let bits = challenge_bits(base, keys, &output_base, &output_keys, &shadows);
    let openings = bits
        .iter()
        .zip(secrets)
        .map(|(&bit, (factor, sigma))| {
            if !bit {
                ShadowOpening::FromInput {
                    factor,
                    permutation: sigma,
                }
            } else {
                let mut sigma_inverse = vec![0u32; n];
                for (position, &index) in sigma.iter().enumerate() {
                    sigma_inverse[index as usize] = position as u32;
                }
                ShadowOpening::ToOutput {
                    factor: blinding * factor.invert(),
                    permutation: pi.iter().map(|&i| sigma_inverse[i as usize]).collect(),
                }
            }
        })
        .collect();

    Ok((
        Shuffle {
            base: output_base,
            keys: output_keys,
            proof: ShuffleProof { shadows, openings },
        },
        blinding,
    ))
}

/// Verify that `output` is a correct shuffle of `(input_base, input_keys)`.
pub fn verify(
    input_base: &RistrettoPoint,
    input_keys: &[RistrettoPoint],
    output: &Shuffle,
) -> CryptoResult<()> {
    let n = input_keys.len();
    if n == 0 {
        return Err(CryptoError::EmptyKeyArray);
    }
    if output.keys.len() != n {
        return Err(CryptoError::InvalidShuffle("output has a different number of keys"));
    }
    let proof = &output.proof;
    if proof.shadows.len() != SHUFFLE_PROOF_ROUNDS || proof.openings.len() != SHUFFLE_PROOF_ROUNDS {
        return Err(CryptoError::InvalidShuffle("wrong number of shadow rounds"));
    }

    let bits = challenge_bits(input_base, input_keys, &output.base, &output.keys, &proof.shadows);

    for ((bit, shadow), opening) in bits.iter().zip(&proof.shadows).zip(&proof.openings) {
        if shadow.keys.len() != n {
            return Err(CryptoError::InvalidShuffle("shadow has a different number of keys"));
        }
        let shadow_base = decompress(&shadow.base)?;
        let shadow_keys = shadow
            .keys
            .iter()
            .map(decompress)
            .collect::<CryptoResult<Vec<_>>>()?;

        match (bit, opening) {
            (false, ShadowOpening::FromInput { factor, permutation }) => {
                check_permutation(permutation, n)?;
                if *factor == Scalar::ZERO || input_base * factor != shadow_base {
                    return Err(CryptoError::InvalidShuffle("shadow base does not open"));
                }
                for (shadow_key, &index) in shadow_keys.iter().zip(permutation) {
                    if input_keys[index as usize] * factor != *shadow_key {
                        return Err(CryptoError::InvalidShuffle("shadow key does not open"));
                    }
                }
            }
            (true, ShadowOpening::ToOutput { factor, permutation }) => {
                check_permutation(permutation, n)?;
                if *factor == Scalar::ZERO || shadow_base * factor != output.base {
                    return Err(CryptoError::InvalidShuffle("output base does not open"));
                }
                for (output_key, &index) in output.keys.iter().zip(permutation) {
                    if shadow_keys[index as usize] * factor != *output_key {
                        return Err(CryptoError::InvalidShuffle("output key does not open"));
                    }
                }
            }
            _ => {
                return Err(CryptoError::InvalidShuffle(
                    "opening does not match its challenge",
                ))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn ephemeral_keys(n: usize, rng: &mut ChaCha20Rng) -> Vec<KeyPair> {
        (0..n).map(|_| KeyPair::generate(rng)).collect()
    }

    #[test]
    fn test_shuffle_verifies_and_every_owner_finds_its_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(41);
        let pairs = ephemeral_keys(4, &mut rng);
        let keys: Vec<_> = pairs.iter().map(KeyPair::public).collect();

        let (output, _) = shuffle(&RISTRETTO_BASEPOINT_POINT, &keys, &mut rng).unwrap();
        assert_eq!(verify(&RISTRETTO_BASEPOINT_POINT, &keys, &output), Ok(()));

        let mut found: Vec<usize> = pairs
            .iter()
            .map(|pair| {
                let mine = output.base * pair.private().as_scalar();
                let matches: Vec<_> = output
                    .keys
                    .iter()
                    .enumerate()
                    .filter(|(_, key)| **key == mine)
                    .map(|(i, _)| i)
                    .collect();
                assert_eq!(matches.len(), 1);
                matches[0]
            })
            .collect();
        found.sort_unstable();
        assert_eq!(found, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_chained_shuffles_verify_against_their_own_input() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let keys: Vec<_> = ephemeral_keys(3, &mut rng).iter().map(KeyPair::public).collect();

        let (first, _) = shuffle(&RISTRETTO_BASEPOINT_POINT, &keys, &mut rng).unwrap();
        let (second, _) = shuffle(&first.base, &first.keys, &mut rng).unwrap();

        assert_eq!(verify(&first.base, &first.keys, &second), Ok(()));
        assert!(verify(&RISTRETTO_BASEPOINT_POINT, &keys, &second).is_err());
    }

    #[test]
    fn test_replaced_key_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(43);
        let keys: Vec<_> = ephemeral_keys(3, &mut rng).iter().map(KeyPair::public).collect();
        let (mut output, _) = shuffle(&RISTRETTO_BASEPOINT_POINT, &keys, &mut rng).unwrap();

        output.keys[1] = KeyPair::generate(&mut rng).public();

        assert!(verify(&RISTRETTO_BASEPOINT_POINT, &keys, &output).is_err());
    }

    #[test]
    fn test_proof_survives_byte_encoding() {
        let mut rng = ChaCha20Rng::seed_from_u64(44);
        let keys: Vec<_> = ephemeral_keys(2, &mut rng).iter().map(KeyPair::public).collect();
        let (output, _) = shuffle(&RISTRETTO_BASEPOINT_POINT, &keys, &mut rng).unwrap();

        let bytes = output.proof.to_bytes().unwrap();
        let decoded = Shuffle {
            proof: ShuffleProof::from_bytes(&bytes).unwrap(),
            ..output.clone()
        };
        assert_eq!(verify(&RISTRETTO_BASEPOINT_POINT, &keys, &decoded), Ok(()));
        assert!(ShuffleProof::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_empty_key_array_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(45);
        assert_eq!(
            shuffle(&RISTRETTO_BASEPOINT_POINT, &[], &mut rng).map(|_| ()),
            Err(CryptoError::EmptyKeyArray)
        );
    }

    #[test]
    fn test_permutation_check() {
        assert_eq!(check_permutation(&[2, 0, 1], 3), Ok(()));
        assert!(check_permutation(&[0, 0, 1], 3).is_err());
        assert!(check_permutation(&[0, 3, 1], 3).is_err());
        assert!(check_permutation(&[0, 1], 3).is_err());
    }
}
