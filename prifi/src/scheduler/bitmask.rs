// Copyright (c) 2024 The PriFi Authors

//! Open/closed slot scheduling with a bitmask.
//!
//! In an open/closed round every client sends a `ceil(n/8)`-byte mask through
//! the DC-net with bit `slot` set if it wants to transmit. The relay decodes
//! the XOR of all masks, which is exactly the set of slots to open, since each
//! slot has a single owner.

/// Length of a mask for `n_clients` slots.
pub fn mask_length(n_clients: usize) -> usize {
    n_clients.div_ceil(8)
}

/// A client's mask: all zeros, or one bit for `slot`.
pub fn client_contribution(n_clients: usize, slot: u32, wants_to_transmit: bool) -> Vec<u8> {
    let mut mask = vec![0u8; mask_length(n_clients)];
    let slot = slot as usize;
    if wants_to_transmit && slot < n_clients {
        mask[slot / 8] |= 1 << (slot % 8);
    }
    mask
}

/// XOR of several masks, as the DC-net would compute it.
pub fn combine(contributions: &[Vec<u8>]) -> Vec<u8> {
    let length = contributions.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = vec![0u8; length];
    for contribution in contributions {
        for (o, b) in out.iter_mut().zip(contribution) {
            *o ^= b;
        }
    }
    out
}

/// Which of the `n_clients` slots the decoded mask opens.
///
/// Bits past the end of `cell` read as closed.
pub fn schedule_from_cell(cell: &[u8], n_clients: usize) -> Vec<bool> {
    (0..n_clients)
        .map(|slot| {
            cell.get(slot / 8)
                .is_some_and(|byte| byte & (1 << (slot % 8)) != 0)
        })
        .collect()
}
