// Copyright (c) 2024 The PriFi Authors

//! Chaum-Pedersen proofs of discrete-log equality.
//!
//! Proves knowledge of `x` such that `X = x*G` and `Y = x*H` without revealing
//! `x`. A party revealing a shared point `Y = priv * peer` proves with it that
//! `Y` was computed from the long-term key behind `X = priv * G`.

use crate::{
    error::{CryptoError, CryptoResult},
    keys::scalar_from_bytes,
};
use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
use merlin::Transcript;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Length of an encoded proof: `c || z`.
pub const DLEQ_PROOF_LENGTH: usize = 64;

/// Non-interactive proof that `log_G(X) == log_H(Y)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DleqProof {
    challenge: Scalar,
    response: Scalar,
}

fn challenge(
    g: &RistrettoPoint,
    h: &RistrettoPoint,
    x: &RistrettoPoint,
    y: &RistrettoPoint,
    a: &RistrettoPoint,
    b: &RistrettoPoint,
) -> Scalar {
    let mut transcript = Transcript::new(b"prifi-dleq-v1");
    for (label, point) in [
        (b"G" as &[u8], g),
        (b"H", h),
        (b"X", x),
        (b"Y", y),
        (b"A", a),
        (b"B", b),
    ] {
        transcript.append_message(label, point.compress().as_bytes());
    }
    let mut wide = [0u8; 64];
    transcript.challenge_bytes(b"c", &mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

impl DleqProof {
    /// Prove that `secret*g` and `secret*h` share the exponent `secret`.
    pub fn prove<R: CryptoRngCore + ?Sized>(
        secret: &Scalar,
        g: &RistrettoPoint,
        h: &RistrettoPoint,
        rng: &mut R,
    ) -> Self {
        let x = g * secret;
        let y = h * secret;
        let w = Scalar::random(rng);
        let a = g * w;
        let b = h * w;
        let c = challenge(g, h, &x, &y, &a, &b);
        Self {
            challenge: c,
            response: w - c * secret,
        }
    }

    /// Check the proof for `x = s*g` and `y = s*h`.
    pub fn verify(
        &self,
        g: &RistrettoPoint,
        h: &RistrettoPoint,
        x: &RistrettoPoint,
        y: &RistrettoPoint,
    ) -> CryptoResult<()> {
        let a = g * self.response + x * self.challenge;
        let b = h * self.response + y * self.challenge;
        if challenge(g, h, x, y, &a, &b) == self.challenge {
            Ok(())
        } else {
            Err(CryptoError::InvalidDleqProof)
        }
    }

    /// Encode as `c || z`.
    pub fn to_bytes(&self) -> [u8; DLEQ_PROOF_LENGTH] {
        let mut out = [0u8; DLEQ_PROOF_LENGTH];
        out[..32].copy_from_slice(self.challenge.as_bytes());
        out[32..].copy_from_slice(self.response.as_bytes());
        out
    }

    /// Decode `c || z`.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != DLEQ_PROOF_LENGTH {
            return Err(CryptoError::LengthMismatch(bytes.len(), DLEQ_PROOF_LENGTH));
        }
        Ok(Self {
            challenge: scalar_from_bytes(&bytes[..32])?,
            response: scalar_from_bytes(&bytes[32..])?,
        })
    }
}
