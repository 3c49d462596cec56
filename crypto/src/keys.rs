// Copyright (c) 2024 The PriFi Authors

//! Keypairs and canonical encodings of group elements.
//!
//! Long-term keys identify clients and trustees for the whole deployment;
//! ephemeral client keys live for one session and are only used to recognize
//! the client's slot after the shuffle.

use crate::error::{CryptoError, CryptoResult};
use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand_core::CryptoRngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a compressed Ristretto point.
pub const POINT_LENGTH: usize = 32;

/// Length of a canonical scalar encoding.
pub const SCALAR_LENGTH: usize = 32;

/// A private scalar. Zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(Scalar);

impl PrivateKey {
    /// Sample a fresh non-zero private key.
    pub fn random<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        loop {
            let scalar = Scalar::random(rng);
            if scalar != Scalar::ZERO {
                return Self(scalar);
            }
        }
    }

    /// Wrap an existing scalar.
    pub fn from_scalar(scalar: Scalar) -> Self {
        Self(scalar)
    }

    /// The underlying scalar.
    pub fn as_scalar(&self) -> &Scalar {
        &self.0
    }

    /// `priv * G`.
    pub fn public_key(&self) -> RistrettoPoint {
        RistrettoPoint::mul_base(&self.0)
    }

    /// `priv * peer`, the Diffie-Hellman shared point.
    pub fn diffie_hellman(&self, peer: &RistrettoPoint) -> RistrettoPoint {
        peer * self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// A private key together with its public point.
#[derive(Clone, Debug)]
pub struct KeyPair {
    private: PrivateKey,
    public: RistrettoPoint,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        Self::from_private(PrivateKey::random(rng))
    }

    /// Derive the keypair of an existing private key.
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// The private half.
    pub fn private(&self) -> &PrivateKey {
        &self.private
    }

    /// The public half.
    pub fn public(&self) -> RistrettoPoint {
        self.public
    }

    /// Shared point with a peer's public key.
    pub fn shared_secret(&self, peer: &RistrettoPoint) -> RistrettoPoint {
        self.private.diffie_hellman(peer)
    }
}

/// Canonical 32-byte encoding of a point.
pub fn point_to_bytes(point: &RistrettoPoint) -> [u8; POINT_LENGTH] {
    point.compress().to_bytes()
}

/// Decode a compressed point, rejecting non-canonical encodings.
pub fn point_from_bytes(bytes: &[u8]) -> CryptoResult<RistrettoPoint> {
    if bytes.len() != POINT_LENGTH {
        return Err(CryptoError::LengthMismatch(bytes.len(), POINT_LENGTH));
    }
    CompressedRistretto::from_slice(bytes)
        .map_err(|_| CryptoError::InvalidPoint)?
        .decompress()
        .ok_or(CryptoError::InvalidPoint)
}

/// Decode a canonical scalar.
pub fn scalar_from_bytes(bytes: &[u8]) -> CryptoResult<Scalar> {
    let array: [u8; SCALAR_LENGTH] = bytes
        .try_into()
        .map_err(|_| CryptoError::LengthMismatch(bytes.len(), SCALAR_LENGTH))?;
    Option::from(Scalar::from_canonical_bytes(array)).ok_or(CryptoError::InvalidScalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn test_shared_secret_is_symmetric() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let client = KeyPair::generate(&mut rng);
        let trustee = KeyPair::generate(&mut rng);

        assert_eq!(
            client.shared_secret(&trustee.public()),
            trustee.shared_secret(&client.public())
        );
    }

    #[test]
    fn test_point_encoding_rejects_bad_input() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let pair = KeyPair::generate(&mut rng);
        let bytes = point_to_bytes(&pair.public());

        assert_eq!(point_from_bytes(&bytes).unwrap(), pair.public());
        assert_eq!(
            point_from_bytes(&bytes[..31]),
            Err(CryptoError::LengthMismatch(31, 32))
        );
        assert_eq!(point_from_bytes(&[0xFF; 32]), Err(CryptoError::InvalidPoint));
    }

    #[test]
    fn test_scalar_encoding_rejects_non_canonical() {
        assert_eq!(scalar_from_bytes(&[0xFF; 32]), Err(CryptoError::InvalidScalar));
        assert_eq!(scalar_from_bytes(&Scalar::ONE.to_bytes()).unwrap(), Scalar::ONE);
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let key = PrivateKey::random(&mut rng);
        assert_eq!(format!("{key:?}"), "PrivateKey([redacted])");
    }
}
