// Copyright (c) 2024 The PriFi Authors

//! Schnorr signatures over Ristretto255.
//!
//! Trustees sign the final shuffle with their long-term keys; relay and clients
//! verify every signature against the trustee keys distributed at setup.

use crate::{
    error::{CryptoError, CryptoResult},
    keys::PrivateKey,
};
use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use merlin::Transcript;
use rand_core::CryptoRngCore;

/// Length of an encoded signature: `R || s`.
pub const SIGNATURE_LENGTH: usize = 64;

/// A Schnorr signature `(R, s)` with `s*G = R + e*P`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    r: CompressedRistretto,
    s: Scalar,
}

impl Signature {
    /// Encode as `R || s`.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        let mut out = [0u8; SIGNATURE_LENGTH];
        out[..32].copy_from_slice(self.r.as_bytes());
        out[32..].copy_from_slice(self.s.as_bytes());
        out
    }

    /// Decode `R || s`.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(CryptoError::LengthMismatch(bytes.len(), SIGNATURE_LENGTH));
        }
        let r = CompressedRistretto::from_slice(&bytes[..32]).map_err(|_| CryptoError::InvalidPoint)?;
        let s = crate::keys::scalar_from_bytes(&bytes[32..])?;
        Ok(Self { r, s })
    }
}

fn challenge(r: &CompressedRistretto, public: &RistrettoPoint, message: &[u8]) -> Scalar {
    let mut transcript = Transcript::new(b"prifi-schnorr-v1");
    transcript.append_message(b"R", r.as_bytes());
    transcript.append_message(b"P", public.compress().as_bytes());
    transcript.append_message(b"m", message);
    let mut wide = [0u8; 64];
    transcript.challenge_bytes(b"e", &mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Sign `message` with `key`.
pub fn sign<R: CryptoRngCore + ?Sized>(key: &PrivateKey, message: &[u8], rng: &mut R) -> Signature {
    let nonce = Scalar::random(rng);
    let r = RistrettoPoint::mul_base(&nonce).compress();
    let e = challenge(&r, &key.public_key(), message);
    Signature {
        r,
        s: nonce + e * key.as_scalar(),
    }
}

/// Verify `signature` on `message` under `public`.
pub fn verify(public: &RistrettoPoint, message: &[u8], signature: &Signature) -> CryptoResult<()> {
    let e = challenge(&signature.r, public, message);
    // R' = s*G - e*P
    let r = RistrettoPoint::vartime_double_scalar_mul_basepoint(&(-e), public, &signature.s);
    if r.compress() == signature.r {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Decode and verify an encoded signature.
pub fn verify_bytes(public: &RistrettoPoint, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    verify(public, message, &Signature::from_bytes(signature)?)
}
