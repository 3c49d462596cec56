// Copyright (c) 2024 The PriFi Authors

//! Hashing into the scalar field.

use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha256, Sha512};

/// `H(data)`: SHA-512 of `data` reduced modulo the group order.
pub fn hash_to_scalar(data: &[u8]) -> Scalar {
    hash_parts_to_scalar(&[data])
}

/// `H(part_0 || part_1 || ...)` reduced modulo the group order.
pub fn hash_parts_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// SHA-256 of a domain label followed by `data`, used to derive symmetric
/// keys from group elements.
pub fn derive_key(label: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_parts_matches_concatenation() {
        assert_eq!(
            hash_parts_to_scalar(&[b"hello ", b"world"]),
            hash_to_scalar(b"hello world")
        );
    }

    #[test]
    fn test_derive_key_is_label_separated() {
        assert_ne!(derive_key(b"a", b"data"), derive_key(b"b", b"data"));
    }
}
