// Copyright (c) 2024 The PriFi Authors

//! Per-client encryption of unicast downstream cells.
//!
//! Each client picks an AES-256 key and IV at setup and hands them to the
//! relay. Cell `r` is encrypted with the counter block `IV + r * 2^32`, so a
//! cell never reuses keystream of another round as long as it is shorter
//! than 64 GiB.

use crate::messages::DownstreamKey;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand_core::CryptoRngCore;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Generate a fresh downstream key and IV.
pub fn generate_key<R: CryptoRngCore + ?Sized>(rng: &mut R) -> DownstreamKey {
    let mut key = DownstreamKey {
        key: [0u8; 32],
        iv: [0u8; 16],
    };
    rng.fill_bytes(&mut key.key);
    rng.fill_bytes(&mut key.iv);
    key
}

fn counter_block(iv: &[u8; 16], round: u32) -> [u8; 16] {
    let start = u128::from_be_bytes(*iv).wrapping_add(u128::from(round) << 32);
    start.to_be_bytes()
}

/// Encrypt or decrypt `data` in place for downstream cell `round`.
pub fn apply(key: &DownstreamKey, round: u32, data: &mut [u8]) {
    let iv = counter_block(&key.iv, round);
    let mut cipher = Aes256Ctr::new(&key.key.into(), &iv.into());
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn test_apply_twice_restores_cell() {
        let mut rng = ChaCha20Rng::seed_from_u64(81);
        let key = generate_key(&mut rng);

        let mut cell = b"downstream cell".to_vec();
        apply(&key, 3, &mut cell);
        assert_ne!(cell, b"downstream cell");
        apply(&key, 3, &mut cell);
        assert_eq!(cell, b"downstream cell");
    }

    #[test]
    fn test_rounds_use_distinct_keystreams() {
        let mut rng = ChaCha20Rng::seed_from_u64(82);
        let key = generate_key(&mut rng);

        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        apply(&key, 1, &mut a);
        apply(&key, 2, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_counter_block_wraps() {
        let iv = [0xFF; 16];
        assert_eq!(counter_block(&iv, 0), iv);
        let next = counter_block(&iv, 1);
        assert_eq!(u128::from_be_bytes(next), (1u128 << 32) - 1);
    }
}
