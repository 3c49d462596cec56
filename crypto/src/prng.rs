// Copyright (c) 2024 The PriFi Authors

//! Keystreams shared between a client and a trustee.
//!
//! Both ends of a pair seed the same AES-256-CTR stream from their
//! Diffie-Hellman point, so they draw identical pads round after round
//! without ever talking to each other again.

use crate::{hash::derive_key, keys::point_to_bytes};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use curve25519_dalek::ristretto::RistrettoPoint;
use std::fmt;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const PAD_KEY_LABEL: &[u8] = b"prifi-dcnet-pad-v1";

/// A seekable keystream derived from a shared point.
pub struct SharedPrng {
    cipher: Aes256Ctr,
    position: u64,
}

impl SharedPrng {
    /// Seed a keystream from a Diffie-Hellman shared point.
    pub fn from_shared_secret(secret: &RistrettoPoint) -> Self {
        let key = derive_key(PAD_KEY_LABEL, &point_to_bytes(secret));
        let iv = [0u8; 16];
        Self {
            cipher: Aes256Ctr::new(&key.into(), &iv.into()),
            position: 0,
        }
    }

    /// Seed a keystream and jump directly to `offset`. Used to replay the pad
    /// of a past round without touching the live stream.
    pub fn at_offset(secret: &RistrettoPoint, offset: u64) -> Self {
        let mut prng = Self::from_shared_secret(secret);
        prng.skip(offset);
        prng
    }

    /// Draw the next `len` keystream bytes.
    pub fn stream(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf);
        buf
    }

    /// Overwrite `buf` with the next keystream bytes.
    pub fn fill(&mut self, buf: &mut [u8]) {
        buf.iter_mut().for_each(|b| *b = 0);
        self.cipher.apply_keystream(buf);
        self.position += buf.len() as u64;
    }

    /// Discard `len` keystream bytes.
    pub fn skip(&mut self, len: u64) {
        self.position += len;
        self.cipher.seek(self.position);
    }

    /// Number of keystream bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl fmt::Debug for SharedPrng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPrng")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use proptest::prelude::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn shared_point(seed: u64) -> RistrettoPoint {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let a = KeyPair::generate(&mut rng);
        let b = KeyPair::generate(&mut rng);
        a.shared_secret(&b.public())
    }

    #[test]
    fn test_both_ends_draw_identical_pads() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let client = KeyPair::generate(&mut rng);
        let trustee = KeyPair::generate(&mut rng);

        let mut a = SharedPrng::from_shared_secret(&client.shared_secret(&trustee.public()));
        let mut b = SharedPrng::from_shared_secret(&trustee.shared_secret(&client.public()));

        for _ in 0..5 {
            assert_eq!(a.stream(24), b.stream(24));
        }
    }

    #[test]
    fn test_skip_matches_draw() {
        let secret = shared_point(8);
        let mut drawn = SharedPrng::from_shared_secret(&secret);
        let mut skipped = SharedPrng::from_shared_secret(&secret);

        drawn.stream(37);
        skipped.skip(37);

        assert_eq!(drawn.position(), skipped.position());
        assert_eq!(drawn.stream(16), skipped.stream(16));
    }

    #[test]
    fn test_at_offset_replays_past_round() {
        let secret = shared_point(9);
        let mut live = SharedPrng::from_shared_secret(&secret);
        let _round0 = live.stream(10);
        let round1 = live.stream(10);

        let mut replay = SharedPrng::at_offset(&secret, 10);
        assert_eq!(replay.stream(10), round1);
    }

    #[test]
    fn test_different_secrets_differ() {
        let mut a = SharedPrng::from_shared_secret(&shared_point(10));
        let mut b = SharedPrng::from_shared_secret(&shared_point(11));
        assert_ne!(a.stream(32), b.stream(32));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_pads_do_not_depend_on_how_they_are_drawn(
            seed in any::<u64>(),
            splits in proptest::collection::vec(0..64usize, 1..8),
        ) {
            let secret = shared_point(seed);
            let total: usize = splits.iter().sum();
            let whole = SharedPrng::from_shared_secret(&secret).stream(total);

            let mut pieces = SharedPrng::from_shared_secret(&secret);
            let drawn: Vec<u8> = splits.iter().flat_map(|&len| pieces.stream(len)).collect();
            prop_assert_eq!(drawn, whole);
        }
    }
}
