// Copyright (c) 2024 The PriFi Authors

//! The PriFi DC-net protocol core.
//!
//! A PriFi session has three kinds of roles:
//!
//! - the [`Relay`], which sequences the setup and combines every round
//! - [`Client`]s, who take turns owning an anonymous upstream slot
//! - [`Trustee`]s, who share a keystream with every client and never talk to
//!   them directly
//!
//! Roles are plain state machines fed one [`Message`] at a time. They send
//! through a [`MessageSender`]; [`service`] runs each of them as a tokio task
//! over a [`ChannelTransport`].
//!
//! ```text
//!   clients ---- UpstreamData ----> relay <---- TrusteeCipher ---- trustees
//!   clients <--- DownstreamData --- relay ----- RateChange ------> trustees
//! ```

#![warn(missing_docs)]

pub mod cells;
pub mod client;
pub mod config;
pub mod dcnet;
pub mod error;
pub mod messages;
pub mod relay;
pub mod rounds;
pub mod scheduler;
pub mod sender;
pub mod service;
pub mod telemetry;
pub mod transport;
pub mod trustee;

#[cfg(test)]
mod harness;

pub use client::{Client, ClientState};
pub use config::{DcNetType, Parameters, PrifiConfig};
pub use error::{PrifiError, PrifiResult};
pub use messages::Message;
pub use relay::{BlameVerdict, Relay, RelayEvent, RelayState};
pub use sender::{MessageSender, SharedSender};
pub use transport::{ChannelTransport, Envelope, Mailbox, Mailboxes};
pub use trustee::{Trustee, TrusteeState};
