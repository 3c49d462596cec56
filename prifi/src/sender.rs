// Copyright (c) 2024 The PriFi Authors

//! The outbound side of every role.
//!
//! Roles never talk to sockets. They hand messages to a [`MessageSender`],
//! which the host wires to whatever carries them: the in-process
//! [`crate::transport::ChannelTransport`], or a real network layer.

use crate::{error::PrifiResult, messages::Message};
use std::{fmt::Debug, sync::Arc};

/// Outbound messaging used by the relay, clients and trustees.
///
/// Sends are fire-and-forget: an error means the message could not be handed
/// to the transport, not that the peer did not process it.
pub trait MessageSender: Send + Sync + Debug {
    /// Send to client `client_id` over its stream connection.
    fn send_to_client(&self, client_id: u32, message: Message) -> PrifiResult<()>;

    /// Send to trustee `trustee_id`.
    fn send_to_trustee(&self, trustee_id: u32, message: Message) -> PrifiResult<()>;

    /// Send to the relay.
    fn send_to_relay(&self, message: Message) -> PrifiResult<()>;

    /// Broadcast a UDP datagram to every subscribed client.
    fn broadcast_to_clients(&self, datagram: Vec<u8>) -> PrifiResult<()>;

    /// Start or stop delivering broadcasts to `client_id`.
    fn client_subscribe_to_broadcast(&self, client_id: u32, subscribe: bool) -> PrifiResult<()>;
}

/// Shared handle to a sender.
pub type SharedSender = Arc<dyn MessageSender>;

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Destination {
        Client(u32),
        Trustee(u32),
        Relay,
        Broadcast,
    }

    /// Keeps everything sent, in order.
    #[derive(Debug, Default)]
    pub struct RecordingSender {
        sent: Mutex<Vec<(Destination, Message)>>,
        subscriptions: Mutex<Vec<(u32, bool)>>,
    }

    impl RecordingSender {
        pub fn take(&self) -> Vec<(Destination, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }

        pub fn subscriptions(&self) -> Vec<(u32, bool)> {
            self.subscriptions.lock().clone()
        }
    }

    impl MessageSender for RecordingSender {
        fn send_to_client(&self, client_id: u32, message: Message) -> PrifiResult<()> {
            self.sent.lock().push((Destination::Client(client_id), message));
            Ok(())
        }

        fn send_to_trustee(&self, trustee_id: u32, message: Message) -> PrifiResult<()> {
            self.sent.lock().push((Destination::Trustee(trustee_id), message));
            Ok(())
        }

        fn send_to_relay(&self, message: Message) -> PrifiResult<()> {
            self.sent.lock().push((Destination::Relay, message));
            Ok(())
        }

        fn broadcast_to_clients(&self, datagram: Vec<u8>) -> PrifiResult<()> {
            let message = Message::from_datagram(&datagram)?;
            self.sent.lock().push((Destination::Broadcast, message));
            Ok(())
        }

        fn client_subscribe_to_broadcast(&self, client_id: u32, subscribe: bool) -> PrifiResult<()> {
            self.subscriptions.lock().push((client_id, subscribe));
            Ok(())
        }
    }
}
