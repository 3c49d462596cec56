// Copyright (c) 2024 The PriFi Authors

//! The client role.
//!
//! A client shares one keystream with every trustee. After the shuffle it
//! knows its anonymous slot, and from then on answers every downstream cell
//! `r` with its cipher for round `r`: a data frame if it owns the slot, zeros
//! otherwise, or its bitmask contribution when the relay asks which slots to
//! open.

use crate::{
    cells::{self, LatencyProbe},
    config::{keys, Parameters, PrifiConfig},
    dcnet::{disruption, downstream, DcNetEntity},
    error::{PrifiError, PrifiResult},
    messages::{DownstreamKey, Message},
    scheduler::{bitmask, recognize_slot},
    sender::SharedSender,
};
use displaydoc::Display;
use prifi_crypto::{point_to_bytes, KeyPair, RistrettoPoint};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Protocol state of a client.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ClientState {
    /// BEFORE_INIT
    BeforeInit,
    /// INITIALIZING
    Initializing,
    /// EPH_KEYS_SENT
    EphKeysSent,
    /// READY
    Ready,
    /// SHUTDOWN
    Shutdown,
}

#[derive(Debug)]
struct Session {
    id: u32,
    config: PrifiConfig,
    keys: KeyPair,
    trustee_pks: Vec<RistrettoPoint>,
    shared_secrets: Vec<RistrettoPoint>,
    dcnet: Option<DcNetEntity>,
    ephemeral: Option<KeyPair>,
    downstream_key: Option<DownstreamKey>,
    slot: Option<u32>,
    slot_keys: Vec<RistrettoPoint>,
    round: u32,
    last_latency_probe: Option<Instant>,
}

impl Session {
    fn dcnet(&mut self) -> PrifiResult<&mut DcNetEntity> {
        self.dcnet
            .as_mut()
            .ok_or(PrifiError::NotInitialized("client DC-net"))
    }

    fn latency_probe_due(&self) -> bool {
        let interval = Duration::from_millis(self.config.client.latency_tests_interval_ms);
        self.config.client.do_latency_tests
            && self
                .last_latency_probe
                .map_or(true, |sent| sent.elapsed() >= interval)
    }
}

/// A client's state machine.
#[derive(Debug)]
pub struct Client {
    state: ClientState,
    sender: SharedSender,
    rng: StdRng,
    session: Option<Session>,
    upstream: VecDeque<Vec<u8>>,
    delivered: VecDeque<Vec<u8>>,
    latencies: Vec<u64>,
}

impl Client {
    /// A client waiting for its parameters.
    pub fn new(sender: SharedSender) -> Self {
        Self::with_rng(sender, StdRng::from_entropy())
    }

    /// A client drawing its keys from `rng`.
    pub fn with_rng(sender: SharedSender, rng: StdRng) -> Self {
        Self {
            state: ClientState::BeforeInit,
            sender,
            rng,
            session: None,
            upstream: VecDeque::new(),
            delivered: VecDeque::new(),
            latencies: Vec::new(),
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Assigned client id, once parameters were received.
    pub fn id(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Long-term public key, once parameters were received.
    pub fn public_key(&self) -> Option<RistrettoPoint> {
        self.session.as_ref().map(|s| s.keys.public())
    }

    /// Anonymous slot, once the shuffle is verified.
    pub fn slot(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.slot)
    }

    /// Next round the client expects a downstream cell for.
    pub fn round(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.round)
    }

    /// Round-trip times of the latency probes, in milliseconds.
    pub fn latencies(&self) -> &[u64] {
        &self.latencies
    }

    /// Number of upstream chunks waiting for an owned slot.
    pub fn pending_upstream(&self) -> usize {
        self.upstream.len()
    }

    /// Queue application data for anonymous transmission, cut into chunks
    /// that fit a slot.
    pub fn queue_upstream(&mut self, data: &[u8]) -> PrifiResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("client session"))?;
        let chunk = cells::max_frame_data(session.config.usable_payload_size());
        if chunk == 0 {
            return Err(PrifiError::PayloadTooLarge(data.len(), 0));
        }
        self.upstream
            .extend(data.chunks(chunk).map(<[u8]>::to_vec));
        trace!(bytes = data.len(), queued = self.upstream.len(), "upstream data queued");
        Ok(())
    }

    /// Downstream data received since the last call.
    pub fn take_delivered(&mut self) -> Vec<Vec<u8>> {
        self.delivered.drain(..).collect()
    }

    /// Ask the relay to find who flipped `bit_pos` in round `round`.
    pub fn request_blame(&mut self, round: u32, bit_pos: u32) -> PrifiResult<()> {
        if self.state != ClientState::Ready {
            return Err(PrifiError::NotInitialized("client blame"));
        }
        let client_id = self
            .id()
            .ok_or(PrifiError::NotInitialized("client session"))?;
        warn!(client_id, round, bit_pos, "blaming disruption");
        self.sender.send_to_relay(Message::DisruptionBlame {
            client_id,
            round_id: round,
            bit_pos,
        })
    }

    fn unexpected(&self, message: &Message) -> PrifiError {
        PrifiError::UnexpectedMessage {
            message: message.name(),
            state: self.state.to_string(),
        }
    }

    /// Handle one message from the relay.
    pub fn received_message(&mut self, message: Message) -> PrifiResult<()> {
        use ClientState::*;

        match (self.state, message) {
            (Shutdown, _) => Ok(()),
            (_, Message::Shutdown) => {
                info!(client_id = ?self.id(), "shutting down");
                self.state = Shutdown;
                Ok(())
            }
            (BeforeInit, Message::Parameters(params)) => self.received_parameters(params),
            (_, Message::Parameters(params)) if params.force_params => {
                self.received_parameters(params)
            }
            (Initializing, Message::TellTrusteesPk { pks }) => self.received_trustee_keys(pks),
            (
                EphKeysSent,
                Message::TellEphPksAndTrusteesSig {
                    base,
                    eph_pks,
                    trustee_sigs,
                },
            ) => self.received_shuffle_result(base, eph_pks, trustee_sigs),
            (
                Ready,
                Message::DownstreamData {
                    round_id,
                    ownership_id,
                    data,
                    flag_resync,
                    flag_open_closed_request,
                },
            ) => self.received_downstream(
                round_id,
                ownership_id,
                data,
                flag_resync,
                flag_open_closed_request,
            ),
            (Ready, Message::DisruptionRevealRequest { round_id, bit_pos }) => {
                self.received_reveal_request(round_id, bit_pos)
            }
            (Ready, Message::DisruptionSecretRequest { peer_id }) => {
                self.received_secret_request(peer_id)
            }
            (_, message) => Err(self.unexpected(&message)),
        }
    }

    fn received_parameters(&mut self, params: Parameters) -> PrifiResult<()> {
        let config = PrifiConfig::from_parameters(&params)?;
        let id = params.int_or(keys::NEXT_FREE_CLIENT_ID, -1);
        let id = u32::try_from(id)
            .ok()
            .filter(|&id| (id as usize) < config.n_clients)
            .ok_or_else(|| PrifiError::InvalidParameters(format!("client id {id}")))?;

        if config.use_udp {
            self.sender.client_subscribe_to_broadcast(id, true)?;
        }
        // data queued before a resync goes out in the next session
        let pending = std::mem::take(&mut self.upstream);
        self.session = Some(Session {
            id,
            config,
            keys: KeyPair::generate(&mut self.rng),
            trustee_pks: Vec::new(),
            shared_secrets: Vec::new(),
            dcnet: None,
            ephemeral: None,
            downstream_key: None,
            slot: None,
            slot_keys: Vec::new(),
            round: 0,
            last_latency_probe: None,
        });
        self.state = ClientState::Initializing;
        info!(client_id = id, pending = pending.len(), "parameters received");
        for chunk in pending {
            self.queue_upstream(&chunk)?;
        }
        Ok(())
    }

    fn received_trustee_keys(&mut self, pks: Vec<RistrettoPoint>) -> PrifiResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(PrifiError::NotInitialized("client session"))?;
        if pks.len() != session.config.n_trustees {
            return Err(PrifiError::MalformedMessage(format!(
                "{} trustee keys for {} trustees",
                pks.len(),
                session.config.n_trustees
            )));
        }

        session.shared_secrets = pks.iter().map(|pk| session.keys.shared_secret(pk)).collect();
        session.trustee_pks = pks;
        session.dcnet = Some(DcNetEntity::new_client(
            session.config.payload_size,
            &session.shared_secrets,
            session.config.equivocation_protection,
        ));
        let ephemeral = KeyPair::generate(&mut self.rng);
        session.downstream_key = session
            .config
            .downstream_traffic_encrypted
            .then(|| downstream::generate_key(&mut self.rng));

        let message = Message::ClientTellPkAndEphPk {
            client_id: session.id,
            pk: session.keys.public(),
            eph_pk: ephemeral.public(),
            downstream_key: session.downstream_key.clone(),
        };
        session.ephemeral = Some(ephemeral);
        debug!(client_id = session.id, "ephemeral key generated");
        self.state = ClientState::EphKeysSent;
        self.sender.send_to_relay(message)
    }

    fn received_shuffle_result(
        &mut self,
        base: RistrettoPoint,
        eph_pks: Vec<RistrettoPoint>,
        trustee_sigs: Vec<Vec<u8>>,
    ) -> PrifiResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(PrifiError::NotInitialized("client session"))?;
        let ephemeral = session
            .ephemeral
            .as_ref()
            .ok_or(PrifiError::NotInitialized("client ephemeral key"))?;
        let slot = match recognize_slot(
            ephemeral.private(),
            &session.trustee_pks,
            &base,
            &eph_pks,
            &trustee_sigs,
        ) {
            Ok(slot) => slot,
            Err(err) if !err.is_fatal() => {
                let client_id = session.id;
                warn!(client_id, %err, "shuffle rejected, asking for a resync");
                return self
                    .sender
                    .send_to_relay(Message::ClientShuffleRejected { client_id });
            }
            Err(err) => return Err(err),
        };
        let slot_key = eph_pks
            .get(slot as usize)
            .map(|key| hex::encode(&point_to_bytes(key)[..8]))
            .unwrap_or_default();
        session.slot = Some(slot);
        session.slot_keys = eph_pks;
        info!(client_id = session.id, slot, %slot_key, "slot recognized, ready");

        // Round 0 opens without a downstream cell.
        let data = session.dcnet()?.encode_for_round(0, false, &[], &mut self.rng)?;
        session.round = 1;
        let client_id = session.id;
        self.state = ClientState::Ready;
        self.sender.send_to_relay(Message::UpstreamData {
            client_id,
            round_id: 0,
            data,
        })
    }

    fn received_downstream(
        &mut self,
        round: u32,
        ownership_id: Option<u32>,
        mut data: Vec<u8>,
        flag_resync: bool,
        flag_open_closed_request: bool,
    ) -> PrifiResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(PrifiError::NotInitialized("client session"))?;
        if flag_resync {
            warn!(client_id = session.id, round, "relay requested a resync");
            self.state = ClientState::Initializing;
            return Ok(());
        }
        if round < session.round {
            debug!(client_id = session.id, round, expected = session.round, "stale downstream cell");
            return Ok(());
        }
        if round > session.round {
            debug!(client_id = session.id, from = session.round, to = round, "skipping rounds");
            session.round = round;
        }

        if let Some(key) = &session.downstream_key {
            downstream::apply(key, round, &mut data);
        }
        session.dcnet()?.update_history(&data);

        if let Some(probes) = cells::decode_latency_probes(&data) {
            let now = cells::now_ms();
            for probe in probes.iter().filter(|p| u32::from(p.client_id) == session.id) {
                let latency = now.saturating_sub(probe.sent_ms);
                debug!(client_id = session.id, round = probe.round, latency, "latency measured");
                self.latencies.push(latency);
            }
        } else if let Some(payload) = cells::unframe_data(&data) {
            self.delivered.push_back(payload.to_vec());
        }

        let client_id = session.id;
        let slot = session.slot.ok_or(PrifiError::NotInitialized("client slot"))?;
        let message = if flag_open_closed_request {
            let wants = !self.upstream.is_empty() || session.latency_probe_due();
            let contribution = bitmask::client_contribution(session.config.n_clients, slot, wants);
            trace!(client_id, round, wants, "open/closed contribution");
            Message::OpenClosedData {
                client_id,
                round_id: round,
                data: session
                    .dcnet()?
                    .encode_contribution(round, &contribution, &mut self.rng)?,
            }
        } else {
            let owner = ownership_id == Some(slot);
            let payload = if owner {
                Self::owned_payload(session, &mut self.upstream, round)?
            } else {
                Vec::new()
            };
            trace!(client_id, round, owner, "upstream cipher");
            Message::UpstreamData {
                client_id,
                round_id: round,
                data: session
                    .dcnet()?
                    .encode_for_round(round, owner, &payload, &mut self.rng)?,
            }
        };
        session.round = round + 1;
        self.sender.send_to_relay(message)
    }

    /// Content of an owned slot: a latency probe when one is due, else the
    /// next data chunk, sealed with the slot key under disruption protection.
    fn owned_payload(
        session: &mut Session,
        upstream: &mut VecDeque<Vec<u8>>,
        round: u32,
    ) -> PrifiResult<Vec<u8>> {
        let capacity = session.config.usable_payload_size();
        let mut body = if session.latency_probe_due() {
            session.last_latency_probe = Some(Instant::now());
            let probe = LatencyProbe {
                client_id: session.id as u16,
                round,
                sent_ms: cells::now_ms(),
            };
            cells::encode_latency_probes(&[probe], capacity)?
        } else if let Some(chunk) = upstream.pop_front() {
            cells::frame_data(&chunk, capacity)?
        } else {
            Vec::new()
        };

        if !session.config.disruption_protection {
            return Ok(body);
        }
        let slot = session.slot.ok_or(PrifiError::NotInitialized("client slot"))?;
        let slot_key = session
            .slot_keys
            .get(slot as usize)
            .ok_or(PrifiError::NotInitialized("client slot key"))?;
        body.resize(capacity, 0);
        Ok(disruption::seal(slot_key, round, &body))
    }

    fn received_reveal_request(&mut self, round: u32, bit_pos: u32) -> PrifiResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("client session"))?;
        let bits = disruption::reveal_bits(
            &session.shared_secrets,
            round,
            session.config.payload_size,
            bit_pos,
        );
        info!(client_id = session.id, round, bit_pos, "revealing pad bits");
        self.sender.send_to_relay(Message::ClientDisruptionReveal {
            client_id: session.id,
            bits,
        })
    }

    fn received_secret_request(&mut self, trustee_id: u32) -> PrifiResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("client session"))?;
        let peer = session
            .trustee_pks
            .get(trustee_id as usize)
            .ok_or(PrifiError::UnknownEntity("trustee", trustee_id))?;
        warn!(client_id = session.id, trustee_id, "revealing shared secret");
        let (secret, proof) =
            disruption::reveal_shared_secret(session.keys.private(), peer, &mut self.rng);
        self.sender.send_to_relay(Message::ClientDisruptionSecret {
            client_id: session.id,
            trustee_id,
            secret,
            proof,
        })
    }
}
