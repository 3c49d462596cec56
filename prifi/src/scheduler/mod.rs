// Copyright (c) 2024 The PriFi Authors

//! Slot assignment.
//!
//! [`neff`] gives each client an anonymous slot once per session;
//! [`bitmask`] decides, every few rounds, which slots are worth opening.

pub mod bitmask;
pub mod neff;

pub use neff::{recognize_slot, signed_blob, RelayShuffleView, TrusteeShuffleView};
