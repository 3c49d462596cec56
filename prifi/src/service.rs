// Copyright (c) 2024 The PriFi Authors

//! Role services.
//!
//! Each role runs as one tokio task that owns its state machine and handles
//! one input at a time: a message from its mailbox, and for the relay a timer
//! event, and for a client upstream data from the host. A recoverable error
//! drops the input and is logged; a fatal one stops the task.
//!
//! A service returns its role when the role shuts down or its mailbox closes,
//! so the host can read what the role collected.

use crate::{
    client::{Client, ClientState},
    config::PrifiConfig,
    error::{PrifiError, PrifiResult},
    messages::Message,
    relay::{Relay, RelayState},
    sender::{MessageSender, SharedSender},
    transport::{ChannelTransport, Mailbox},
    trustee::{Trustee, TrusteeState},
};
use std::{collections::VecDeque, sync::Arc};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Keep going after a recoverable error, stop on a fatal one.
fn check(role: &str, result: PrifiResult<()>) -> PrifiResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_fatal() => {
            error!(role, %err, "stopping");
            Err(err)
        }
        Err(err) => {
            warn!(role, %err, "input dropped");
            Ok(())
        }
    }
}

/// Run the relay until it shuts down.
pub async fn run_relay(mut relay: Relay, mut mailbox: Mailbox) -> PrifiResult<Relay> {
    let (timers_tx, mut timers) = unbounded_channel();
    relay.set_timer_channel(timers_tx);

    while relay.state() != RelayState::Shutdown {
        let handled = tokio::select! {
            envelope = mailbox.recv() => match envelope {
                Some(envelope) => envelope.open().and_then(|message| relay.received_message(message)),
                None => {
                    debug!("relay mailbox closed");
                    break;
                }
            },
            Some(event) = timers.recv() => relay.handle_event(event),
        };
        check("relay", handled)?;
    }
    info!(state = %relay.state(), "relay service stopped");
    Ok(relay)
}

/// Run a client until it shuts down.
///
/// Data received on `upstream` is queued for the client's slot, and held back
/// until the client is ready. The client keeps running once `upstream` is
/// closed.
pub async fn run_client(
    mut client: Client,
    mut mailbox: Mailbox,
    mut upstream: UnboundedReceiver<Vec<u8>>,
) -> PrifiResult<Client> {
    let mut upstream_open = true;
    let mut backlog = VecDeque::new();

    while client.state() != ClientState::Shutdown {
        let handled = tokio::select! {
            envelope = mailbox.recv() => match envelope {
                Some(envelope) => envelope.open().and_then(|message| client.received_message(message)),
                None => {
                    debug!(client_id = ?client.id(), "client mailbox closed");
                    break;
                }
            },
            data = upstream.recv(), if upstream_open => {
                match data {
                    Some(data) => backlog.push_back(data),
                    None => upstream_open = false,
                }
                Ok(())
            },
        };
        check("client", handled)?;

        if client.state() == ClientState::Ready {
            while let Some(data) = backlog.pop_front() {
                check("client", client.queue_upstream(&data))?;
            }
        }
    }
    Ok(client)
}

/// Run a trustee until it shuts down. Its cipher loop runs on the same
/// runtime.
pub async fn run_trustee(mut trustee: Trustee, mut mailbox: Mailbox) -> PrifiResult<Trustee> {
    while trustee.state() != TrusteeState::Shutdown {
        let Some(envelope) = mailbox.recv().await else {
            debug!(trustee_id = ?trustee.id(), "trustee mailbox closed");
            break;
        };
        let handled = envelope
            .open()
            .and_then(|message| trustee.received_message(message));
        check("trustee", handled)?;
    }
    Ok(trustee)
}

/// A whole session running on the current runtime.
#[derive(Debug)]
pub struct LocalSession {
    /// Transport shared by every role
    pub transport: Arc<ChannelTransport>,
    /// The relay task
    pub relay: JoinHandle<PrifiResult<Relay>>,
    /// One task per client
    pub clients: Vec<JoinHandle<PrifiResult<Client>>>,
    /// One task per trustee
    pub trustees: Vec<JoinHandle<PrifiResult<Trustee>>>,
    /// Upstream input of each client
    pub upstream: Vec<UnboundedSender<Vec<u8>>>,
}

/// The outcome of a [`LocalSession`].
#[derive(Debug)]
pub struct SessionReport {
    /// The relay, as it stopped
    pub relay: Relay,
    /// The clients, as they stopped
    pub clients: Vec<Client>,
    /// The trustees, as they stopped
    pub trustees: Vec<Trustee>,
}

/// Spawn every role of `config` and hand the relay its parameters.
///
/// Must be called within a tokio runtime.
pub fn spawn_local_session(config: &PrifiConfig) -> PrifiResult<LocalSession> {
    config.validate()?;
    let (transport, mailboxes) = ChannelTransport::new(config.n_clients, config.n_trustees);
    let sender: SharedSender = transport.clone();

    let mut upstream = Vec::with_capacity(config.n_clients);
    let clients = mailboxes
        .clients
        .into_iter()
        .map(|mailbox| {
            let (tx, rx) = unbounded_channel();
            upstream.push(tx);
            tokio::spawn(run_client(Client::new(sender.clone()), mailbox, rx))
        })
        .collect();
    let trustees = mailboxes
        .trustees
        .into_iter()
        .map(|mailbox| tokio::spawn(run_trustee(Trustee::new(sender.clone()), mailbox)))
        .collect();
    let relay = tokio::spawn(run_relay(Relay::new(sender), mailboxes.relay));

    info!(
        n_clients = config.n_clients,
        n_trustees = config.n_trustees,
        "local session spawned"
    );
    transport.send_to_relay(Message::Parameters(config.to_parameters()))?;

    Ok(LocalSession {
        transport,
        relay,
        clients,
        trustees,
        upstream,
    })
}

async fn join<T>(handle: JoinHandle<PrifiResult<T>>) -> PrifiResult<T> {
    handle
        .await
        .map_err(|err| PrifiError::Transport(format!("role task failed: {err}")))?
}

impl LocalSession {
    /// Queue `data` at client `client_id`.
    pub fn send_upstream(&self, client_id: u32, data: Vec<u8>) -> PrifiResult<()> {
        self.upstream
            .get(client_id as usize)
            .ok_or(PrifiError::UnknownEntity("client", client_id))?
            .send(data)
            .map_err(|_| PrifiError::Transport("client service stopped".to_string()))
    }

    /// Wait for the relay to stop, then for everyone it told to stop.
    pub async fn finish(self) -> PrifiResult<SessionReport> {
        let relay = join(self.relay).await?;
        drop(self.upstream);

        let mut clients = Vec::with_capacity(self.clients.len());
        for handle in self.clients {
            clients.push(join(handle).await?);
        }
        let mut trustees = Vec::with_capacity(self.trustees.len());
        for handle in self.trustees {
            trustees.push(join(handle).await?);
        }
        Ok(SessionReport {
            relay,
            clients,
            trustees,
        })
    }

    /// Ask the relay to shut the session down.
    pub fn shutdown(&self) -> PrifiResult<()> {
        self.transport.send_to_relay(Message::Shutdown)
    }
}
