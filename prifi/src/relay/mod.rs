// Copyright (c) 2024 The PriFi Authors

//! The relay role.
//!
//! The relay drives the session: it forwards the parameters, sequences the
//! shuffle, then runs the rounds. Every round starts with a downstream cell
//! and ends when the relay has combined the ciphers of every client and
//! trustee:
//!
//! ```text
//!   send_many ---- DownstreamData(r) ---> clients
//!       ^                                    |
//!       |        <--- UpstreamData(r) -------+
//!       |        <--- TrusteeCipher(r) ---- trustees (ahead of time)
//!       |                 |
//!   finalize(r) <--- decode(r) ---> upstream data / slot schedule
//! ```
//!
//! Up to `W` rounds are in flight. Timeouts arrive as [`RelayEvent`]s through
//! the same processing task as messages.
//!
//! A resync sends one last downstream cell flagged `flag_resync`, then the
//! relay broadcasts its parameters again with `force_params` set and every
//! role runs the setup from the start.

mod blame;
mod comm;
mod setup;
pub mod stats;
mod timeouts;

pub use blame::BlameVerdict;

use crate::{
    config::{Parameters, PrifiConfig},
    dcnet::DcNetEntity,
    error::{PrifiError, PrifiResult},
    messages::{DownstreamKey, Message},
    rounds::BufferedRoundManager,
    scheduler::RelayShuffleView,
    sender::SharedSender,
};
use blame::BlameState;
use displaydoc::Display;
use prifi_crypto::RistrettoPoint;
use stats::RelayStatistics;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::{atomic::AtomicU64, Arc},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Protocol state of the relay.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RelayState {
    /// BEFORE_INIT
    BeforeInit,
    /// COLLECTING_TRUSTEES_PKS
    CollectingTrusteesPks,
    /// COLLECTING_CLIENT_PKS
    CollectingClientPks,
    /// COLLECTING_SHUFFLES
    CollectingShuffles,
    /// COLLECTING_SHUFFLE_SIGNATURES
    CollectingShuffleSignatures,
    /// COMMUNICATING
    Communicating,
    /// BLAMING
    Blaming,
    /// SHUTDOWN
    Shutdown,
}

/// Timer events fed back into the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// Round may have lost a broadcast
    TimeoutPhase1(u32),
    /// Round is given up if still current
    TimeoutPhase2(u32),
    /// End of the pause after a schedule closing every slot
    ResumeAfterClosedSchedule,
}

/// Called with the clients and trustees missing from an aborted round.
pub type TimeoutHandler = Box<dyn Fn(&[u32], &[u32]) + Send + Sync>;

#[derive(Debug)]
struct ClientKeys {
    pk: RistrettoPoint,
    eph_pk: RistrettoPoint,
    downstream_key: Option<DownstreamKey>,
}

/// One session, from parameters to shutdown.
#[derive(Debug)]
struct Session {
    config: PrifiConfig,
    force_params: bool,
    trustee_pks: Vec<Option<RistrettoPoint>>,
    clients: Vec<Option<ClientKeys>>,
    shuffle: Option<RelayShuffleView>,
    slot_keys: Vec<RistrettoPoint>,
    rounds: BufferedRoundManager,
    dcnet: DcNetEntity,
    round_owners: BTreeMap<u32, Option<u32>>,
    open_closed_rounds: BTreeSet<u32>,
    non_acked: usize,
    paused: bool,
    next_resync: bool,
    blame: Option<BlameState>,
    stats: RelayStatistics,
}

impl Session {
    fn trustee_pk(&self, trustee_id: u32) -> PrifiResult<RistrettoPoint> {
        self.trustee_pks
            .get(trustee_id as usize)
            .copied()
            .flatten()
            .ok_or(PrifiError::UnknownEntity("trustee", trustee_id))
    }

    fn client_keys(&self, client_id: u32) -> PrifiResult<&ClientKeys> {
        self.clients
            .get(client_id as usize)
            .and_then(Option::as_ref)
            .ok_or(PrifiError::UnknownEntity("client", client_id))
    }
}

/// The relay's state machine.
pub struct Relay {
    state: RelayState,
    sender: SharedSender,
    session: Option<Session>,
    timers: Option<UnboundedSender<RelayEvent>>,
    timer_generation: Arc<AtomicU64>,
    timeout_handler: Option<TimeoutHandler>,
    upstream_out: VecDeque<Vec<u8>>,
    downstream_queue: VecDeque<Vec<u8>>,
    priority_queue: VecDeque<Vec<u8>>,
    results: Vec<String>,
    experiment_results: Option<Vec<String>>,
    last_blame: Option<BlameVerdict>,
    resyncs: u32,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("timers", &self.timers.is_some())
            .field("upstream_out", &self.upstream_out.len())
            .field("downstream_queue", &self.downstream_queue.len())
            .field("priority_queue", &self.priority_queue.len())
            .field("last_blame", &self.last_blame)
            .field("resyncs", &self.resyncs)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// A relay waiting for its parameters.
    pub fn new(sender: SharedSender) -> Self {
        Self {
            state: RelayState::BeforeInit,
            sender,
            session: None,
            timers: None,
            timer_generation: Arc::new(AtomicU64::new(0)),
            timeout_handler: None,
            upstream_out: VecDeque::new(),
            downstream_queue: VecDeque::new(),
            priority_queue: VecDeque::new(),
            results: Vec::new(),
            experiment_results: None,
            last_blame: None,
            resyncs: 0,
        }
    }

    /// Deliver timeouts into `timers`. Without it, no timeout fires.
    pub fn set_timer_channel(&mut self, timers: UnboundedSender<RelayEvent>) {
        self.timers = Some(timers);
    }

    /// Install the callback told about aborted rounds.
    pub fn set_timeout_handler(&mut self, handler: TimeoutHandler) {
        self.timeout_handler = Some(handler);
    }

    /// Current protocol state.
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Smallest open round.
    pub fn current_round(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.rounds.current_round())
    }

    /// Number of downstream cells whose round is still open.
    pub fn rounds_in_flight(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.non_acked)
    }

    /// Slot keys, once every trustee signed the shuffle.
    pub fn slot_keys(&self) -> &[RistrettoPoint] {
        self.session
            .as_ref()
            .map_or(&[][..], |s| s.slot_keys.as_slice())
    }

    /// Queue data for the clients, cut into frames that fit a downstream
    /// cell.
    pub fn queue_downstream(&mut self, data: &[u8]) -> PrifiResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("relay session"))?;
        let capacity = session.config.downstream_cell_size;
        let chunk = crate::cells::max_frame_data(capacity);
        if chunk == 0 {
            return Err(PrifiError::PayloadTooLarge(data.len(), 0));
        }
        for piece in data.chunks(chunk) {
            self.downstream_queue
                .push_back(crate::cells::frame_data(piece, capacity)?);
        }
        Ok(())
    }

    /// Anonymous upstream data decoded since the last call.
    pub fn take_upstream(&mut self) -> Vec<Vec<u8>> {
        self.upstream_out.drain(..).collect()
    }

    /// Results collected so far: statistics, aborted rounds, blame verdicts.
    pub fn results(&self) -> &[String] {
        &self.results
    }

    /// Results of an experiment that reached its round limit, once.
    pub fn take_experiment_results(&mut self) -> Option<Vec<String>> {
        self.experiment_results.take()
    }

    /// Outcome of the last blame.
    pub fn last_blame(&self) -> Option<BlameVerdict> {
        self.last_blame
    }

    /// How many times the setup was run again.
    pub fn resyncs(&self) -> u32 {
        self.resyncs
    }

    /// Ask the clients to go back to setup with the next downstream cell.
    ///
    /// Before communication starts there is no cell to carry the flag, so the
    /// setup starts over at once.
    pub fn request_resync(&mut self) -> PrifiResult<()> {
        match self.state {
            RelayState::BeforeInit | RelayState::Shutdown => Ok(()),
            RelayState::Communicating | RelayState::Blaming => {
                self.session_mut()?.next_resync = true;
                Ok(())
            }
            _ => self.resync("requested during setup"),
        }
    }

    fn unexpected(&self, message: &Message) -> PrifiError {
        PrifiError::UnexpectedMessage {
            message: message.name(),
            state: self.state.to_string(),
        }
    }

    fn session_mut(&mut self) -> PrifiResult<&mut Session> {
        self.session
            .as_mut()
            .ok_or(PrifiError::NotInitialized("relay session"))
    }

    /// Handle one message from a client, a trustee or the host.
    pub fn received_message(&mut self, message: Message) -> PrifiResult<()> {
        use RelayState::*;

        match (self.state, message) {
            (Shutdown, _) => Ok(()),
            (_, Message::Shutdown) => {
                self.shutdown();
                Ok(())
            }
            (BeforeInit, Message::Parameters(params)) => self.received_parameters(params),
            (_, Message::Parameters(params)) if params.force_params => {
                self.received_parameters(params)
            }

            (CollectingTrusteesPks, Message::TrusteeTellPk { trustee_id, pk }) => {
                self.received_trustee_pk(trustee_id, pk)
            }
            (
                CollectingClientPks,
                Message::ClientTellPkAndEphPk {
                    client_id,
                    pk,
                    eph_pk,
                    downstream_key,
                },
            ) => self.received_client_pk(client_id, pk, eph_pk, downstream_key),
            (
                CollectingShuffles,
                Message::TrusteeTellNewBaseAndEphPks {
                    trustee_id,
                    new_base,
                    new_eph_pks,
                    proof,
                    ..
                },
            ) => self.received_shuffle(trustee_id, new_base, new_eph_pks, proof),
            (CollectingShuffleSignatures, Message::TrusteeShuffleSig { trustee_id, sig }) => {
                self.received_shuffle_signature(trustee_id, sig)
            }
            (Communicating | Blaming, Message::ClientShuffleRejected { client_id }) => {
                self.received_shuffle_rejected(client_id)
            }

            (
                CollectingShuffleSignatures | Communicating | Blaming,
                Message::TrusteeCipher {
                    round_id,
                    trustee_id,
                    data,
                },
            ) => self.received_trustee_cipher(round_id, trustee_id, data),
            (
                Communicating | Blaming,
                Message::UpstreamData {
                    client_id,
                    round_id,
                    data,
                }
                | Message::OpenClosedData {
                    client_id,
                    round_id,
                    data,
                },
            ) => self.received_client_cipher(round_id, client_id, data),

            (
                Communicating,
                Message::DisruptionBlame {
                    client_id,
                    round_id,
                    bit_pos,
                },
            ) => self.received_blame(client_id, round_id, bit_pos),
            (Blaming, Message::ClientDisruptionReveal { client_id, bits }) => {
                self.received_client_reveal(client_id, bits)
            }
            (Blaming, Message::TrusteeDisruptionReveal { trustee_id, bits }) => {
                self.received_trustee_reveal(trustee_id, bits)
            }
            (
                Blaming,
                Message::ClientDisruptionSecret {
                    client_id,
                    trustee_id,
                    secret,
                    proof,
                },
            ) => self.received_client_secret(client_id, trustee_id, secret, proof),
            (
                Blaming,
                Message::TrusteeDisruptionSecret {
                    trustee_id,
                    client_id,
                    secret,
                    proof,
                },
            ) => self.received_trustee_secret(trustee_id, client_id, secret, proof),

            (_, message) => Err(self.unexpected(&message)),
        }
    }

    /// Tell every participant to stop, then stop.
    pub fn shutdown(&mut self) {
        if self.state == RelayState::Shutdown {
            return;
        }
        info!(state = %self.state, "relay shutting down");
        if let Some(session) = &self.session {
            for trustee_id in 0..session.config.n_trustees as u32 {
                let _ = self.sender.send_to_trustee(trustee_id, Message::Shutdown);
            }
            for client_id in 0..session.config.n_clients as u32 {
                let _ = self.sender.send_to_client(client_id, Message::Shutdown);
            }
        }
        self.state = RelayState::Shutdown;
    }

    fn params_for(session: &Session, key: &str, id: u32) -> Parameters {
        let mut params = session.config.to_parameters();
        params.set_int(key, i64::from(id));
        params.force_params = session.force_params;
        params
    }
}
