// Copyright (c) 2024 The PriFi Authors

//! In-process transport over tokio channels.
//!
//! Every role gets one unbounded mailbox. Stream messages travel
//! bincode-encoded, exactly as they would over a socket, and broadcast
//! datagrams are copied into the mailbox of every subscribed client.

use crate::{
    error::{PrifiError, PrifiResult},
    messages::Message,
    sender::MessageSender,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// What arrives in a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// An encoded [`Message`] from a stream connection
    Stream(Vec<u8>),
    /// A downstream UDP datagram
    Datagram(Vec<u8>),
}

impl Envelope {
    /// Decode the message inside.
    pub fn open(&self) -> PrifiResult<Message> {
        match self {
            Envelope::Stream(bytes) => Message::from_bytes(bytes),
            Envelope::Datagram(bytes) => Message::from_datagram(bytes),
        }
    }
}

/// Receiving side of a mailbox.
pub type Mailbox = UnboundedReceiver<Envelope>;

/// The mailboxes of one session, to hand to the role services.
#[derive(Debug)]
pub struct Mailboxes {
    /// The relay's mailbox
    pub relay: Mailbox,
    /// One mailbox per client
    pub clients: Vec<Mailbox>,
    /// One mailbox per trustee
    pub trustees: Vec<Mailbox>,
}

/// A [`MessageSender`] that delivers into tokio channels.
#[derive(Debug)]
pub struct ChannelTransport {
    relay: UnboundedSender<Envelope>,
    clients: Vec<UnboundedSender<Envelope>>,
    trustees: Vec<UnboundedSender<Envelope>>,
    subscribed: Mutex<Vec<bool>>,
}

fn deliver(to: &UnboundedSender<Envelope>, envelope: Envelope) -> PrifiResult<()> {
    to.send(envelope)
        .map_err(|_| PrifiError::Transport("mailbox closed".to_string()))
}

impl ChannelTransport {
    /// A transport for one relay, `n_clients` clients and `n_trustees`
    /// trustees.
    pub fn new(n_clients: usize, n_trustees: usize) -> (Arc<Self>, Mailboxes) {
        let (relay, relay_rx) = unbounded_channel();
        let (clients, client_rxs): (Vec<_>, Vec<_>) =
            (0..n_clients).map(|_| unbounded_channel()).unzip();
        let (trustees, trustee_rxs): (Vec<_>, Vec<_>) =
            (0..n_trustees).map(|_| unbounded_channel()).unzip();

        let transport = Arc::new(Self {
            relay,
            clients,
            trustees,
            subscribed: Mutex::new(vec![false; n_clients]),
        });
        let mailboxes = Mailboxes {
            relay: relay_rx,
            clients: client_rxs,
            trustees: trustee_rxs,
        };
        (transport, mailboxes)
    }

    fn stream(message: &Message) -> PrifiResult<Envelope> {
        Ok(Envelope::Stream(message.to_bytes()?))
    }
}

impl MessageSender for ChannelTransport {
    fn send_to_client(&self, client_id: u32, message: Message) -> PrifiResult<()> {
        let to = self
            .clients
            .get(client_id as usize)
            .ok_or(PrifiError::UnknownEntity("client", client_id))?;
        trace!(client_id, message = message.name(), "to client");
        deliver(to, Self::stream(&message)?)
    }

    fn send_to_trustee(&self, trustee_id: u32, message: Message) -> PrifiResult<()> {
        let to = self
            .trustees
            .get(trustee_id as usize)
            .ok_or(PrifiError::UnknownEntity("trustee", trustee_id))?;
        trace!(trustee_id, message = message.name(), "to trustee");
        deliver(to, Self::stream(&message)?)
    }

    fn send_to_relay(&self, message: Message) -> PrifiResult<()> {
        trace!(message = message.name(), "to relay");
        deliver(&self.relay, Self::stream(&message)?)
    }

    fn broadcast_to_clients(&self, datagram: Vec<u8>) -> PrifiResult<()> {
        let subscribed = self.subscribed.lock().clone();
        for (client, to) in self.clients.iter().enumerate() {
            // closed mailboxes behave like a lost datagram
            if subscribed[client] {
                let _ = to.send(Envelope::Datagram(datagram.clone()));
            }
        }
        Ok(())
    }

    fn client_subscribe_to_broadcast(&self, client_id: u32, subscribe: bool) -> PrifiResult<()> {
        let mut subscribed = self.subscribed.lock();
        let slot = subscribed
            .get_mut(client_id as usize)
            .ok_or(PrifiError::UnknownEntity("client", client_id))?;
        *slot = subscribe;
        Ok(())
    }
}
