// Copyright (c) 2024 The PriFi Authors

//! Cryptographic primitives for the PriFi protocol core.
//!
//! Every PriFi role works in the Ristretto255 prime-order group. This crate
//! bundles the pieces the protocol needs on top of the group:
//!
//! - [`keys`]: long-term and ephemeral keypairs, point/scalar encodings and
//!   Diffie-Hellman shared points
//! - [`hash`]: hashing bytes to group scalars
//! - [`prng`]: the AES-CTR keystream seeded from a shared point that drives the
//!   DC-net pads
//! - [`schnorr`]: Schnorr signatures used by trustees to co-sign the shuffle
//! - [`dleq`]: discrete-log equality proofs used when a party reveals a shared
//!   secret during disruption blame
//! - [`shuffle`]: the verifiable shuffle of ephemeral keys performed by each
//!   trustee, with its non-interactive proof
//!
//! ```text
//!   client i                 trustee j
//!   priv_i, pub_i            priv_j, pub_j
//!        \                       /
//!         K_ij = priv_i * pub_j = priv_j * pub_i
//!                     |
//!               SharedPrng(K_ij)  ->  P pad bytes per round
//! ```

#![warn(missing_docs)]

pub mod dleq;
mod error;
pub mod hash;
pub mod keys;
pub mod prng;
pub mod schnorr;
pub mod shuffle;

pub use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
pub use error::{CryptoError, CryptoResult};
pub use keys::{point_from_bytes, point_to_bytes, scalar_from_bytes, KeyPair, PrivateKey};
pub use prng::SharedPrng;
pub use shuffle::{Shuffle, ShuffleProof, SHUFFLE_PROOF_ROUNDS};
