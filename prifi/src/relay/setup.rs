// Copyright (c) 2024 The PriFi Authors

//! Setup: parameters, key collection and the shuffle.

use super::{ClientKeys, Relay, RelayEvent, RelayState, Session};
use crate::{
    config::{keys, Parameters, PrifiConfig},
    dcnet::DcNetEntity,
    error::{PrifiError, PrifiResult},
    messages::{DownstreamKey, Message},
    rounds::{rate_limit::RateCallback, BufferedRoundManager},
    scheduler::RelayShuffleView,
    sender::SharedSender,
};
use prifi_crypto::RistrettoPoint;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::Ordering,
};
use tracing::{debug, info, warn};

fn rate_callback(sender: SharedSender, window_capacity: u32) -> RateCallback {
    Box::new(move |trustee_id| {
        if let Err(err) = sender.send_to_trustee(trustee_id, Message::RateChange { window_capacity }) {
            warn!(trustee_id, %err, "could not send rate change");
        }
    })
}

impl Relay {
    pub(super) fn received_parameters(&mut self, params: Parameters) -> PrifiResult<()> {
        let config = PrifiConfig::from_parameters(&params)?;
        let rounds = BufferedRoundManager::new(config.n_clients, config.n_trustees, config.window_size);
        rounds.add_rate_limiter(
            config.relay.trustee_cache_low_bound,
            config.relay.trustee_cache_high_bound,
            rate_callback(self.sender.clone(), 0),
            rate_callback(self.sender.clone(), config.window_size as u32),
        )?;

        info!(
            n_clients = config.n_clients,
            n_trustees = config.n_trustees,
            payload_size = config.payload_size,
            window_size = config.window_size,
            force = params.force_params,
            "relay parameters received"
        );
        let start_now = config.relay.start_now;
        self.session = Some(Session {
            dcnet: DcNetEntity::new_relay(config.payload_size, config.equivocation_protection),
            trustee_pks: vec![None; config.n_trustees],
            clients: (0..config.n_clients).map(|_| None).collect(),
            config,
            force_params: params.force_params,
            shuffle: None,
            slot_keys: Vec::new(),
            rounds,
            round_owners: BTreeMap::new(),
            open_closed_rounds: BTreeSet::new(),
            non_acked: 0,
            paused: false,
            next_resync: false,
            blame: None,
            stats: Default::default(),
        });
        self.priority_queue.clear();
        self.state = RelayState::CollectingTrusteesPks;

        if start_now {
            self.start_setup()?;
        }
        Ok(())
    }

    /// Send the parameters to every trustee and client, assigning their ids.
    ///
    /// Called on parameters when `StartNow` is set; otherwise the host calls
    /// it once everybody is connected.
    pub fn start_setup(&mut self) -> PrifiResult<()> {
        if self.state != RelayState::CollectingTrusteesPks {
            return Err(PrifiError::NotInitialized("relay setup"));
        }
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("relay session"))?;
        for trustee_id in 0..session.config.n_trustees as u32 {
            let params = Self::params_for(session, keys::NEXT_FREE_TRUSTEE_ID, trustee_id);
            self.sender
                .send_to_trustee(trustee_id, Message::Parameters(params))?;
        }
        for client_id in 0..session.config.n_clients as u32 {
            let params = Self::params_for(session, keys::NEXT_FREE_CLIENT_ID, client_id);
            self.sender
                .send_to_client(client_id, Message::Parameters(params))?;
        }
        debug!("parameters sent");
        Ok(())
    }

    /// Run the setup again with the parameters of the current session.
    ///
    /// Timers armed for the old session are dropped; queued downstream data
    /// and decoded upstream data are kept.
    pub(super) fn resync(&mut self, reason: &str) -> PrifiResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("relay session"))?;
        let mut params = session.config.to_parameters();
        params.force_params = true;
        let start_now = session.config.relay.start_now;

        self.resyncs += 1;
        warn!(reason, state = %self.state, resyncs = self.resyncs, "running the setup again");
        self.timer_generation.fetch_add(1, Ordering::Relaxed);
        self.received_parameters(params)?;
        if !start_now {
            self.start_setup()?;
        }
        Ok(())
    }

    pub(super) fn received_trustee_pk(
        &mut self,
        trustee_id: u32,
        pk: RistrettoPoint,
    ) -> PrifiResult<()> {
        let session = self.session_mut()?;
        let slot = session
            .trustee_pks
            .get_mut(trustee_id as usize)
            .ok_or(PrifiError::UnknownEntity("trustee", trustee_id))?;
        if slot.is_some() {
            return Err(PrifiError::DuplicateEntity("trustee", trustee_id));
        }
        *slot = Some(pk);
        debug!(trustee_id, "trustee key received");

        let pks: Option<Vec<_>> = session.trustee_pks.iter().copied().collect();
        let Some(pks) = pks else {
            return Ok(());
        };
        let n_clients = session.config.n_clients as u32;
        info!("all trustee keys received");
        self.state = RelayState::CollectingClientPks;
        for client_id in 0..n_clients {
            self.sender
                .send_to_client(client_id, Message::TellTrusteesPk { pks: pks.clone() })?;
        }
        Ok(())
    }

    pub(super) fn received_client_pk(
        &mut self,
        client_id: u32,
        pk: RistrettoPoint,
        eph_pk: RistrettoPoint,
        downstream_key: Option<DownstreamKey>,
    ) -> PrifiResult<()> {
        let session = self.session_mut()?;
        if session.config.downstream_traffic_encrypted && downstream_key.is_none() {
            return Err(PrifiError::MalformedMessage(format!(
                "client {client_id} sent no downstream key"
            )));
        }
        let slot = session
            .clients
            .get_mut(client_id as usize)
            .ok_or(PrifiError::UnknownEntity("client", client_id))?;
        if slot.is_some() {
            return Err(PrifiError::DuplicateEntity("client", client_id));
        }
        *slot = Some(ClientKeys {
            pk,
            eph_pk,
            downstream_key,
        });
        debug!(client_id, "client keys received");

        if session.clients.iter().any(Option::is_none) {
            return Ok(());
        }
        let eph_pks = session
            .clients
            .iter()
            .flatten()
            .map(|client| client.eph_pk)
            .collect();
        let shuffle = RelayShuffleView::new(session.config.n_trustees, eph_pks)?;
        info!("all client keys received, starting the shuffle");
        session.shuffle = Some(shuffle);
        self.state = RelayState::CollectingShuffles;
        self.send_next_shuffle_request()
    }

    fn send_next_shuffle_request(&mut self) -> PrifiResult<()> {
        let session = self.session_mut()?;
        let shuffle = session
            .shuffle
            .as_ref()
            .ok_or(PrifiError::NotInitialized("relay shuffle"))?;
        let trustee_id = shuffle
            .current_trustee()
            .ok_or(PrifiError::NotInitialized("next shuffling trustee"))?;
        let (base, eph_pks) = shuffle.next_input();
        let pks = session.clients.iter().flatten().map(|client| client.pk).collect();
        debug!(trustee_id, "requesting shuffle");
        self.sender.send_to_trustee(
            trustee_id,
            Message::TellClientsPksAndEphPksAndBase { pks, eph_pks, base },
        )
    }

    pub(super) fn received_shuffle(
        &mut self,
        trustee_id: u32,
        base: RistrettoPoint,
        eph_pks: Vec<RistrettoPoint>,
        proof: Vec<u8>,
    ) -> PrifiResult<()> {
        let session = self.session_mut()?;
        let shuffle = session
            .shuffle
            .as_mut()
            .ok_or(PrifiError::NotInitialized("relay shuffle"))?;
        if !shuffle.received_shuffle(trustee_id, base, eph_pks, proof)? {
            return self.send_next_shuffle_request();
        }

        let transcript = shuffle.transcript();
        let n_trustees = session.config.n_trustees as u32;
        info!("all trustees shuffled, sending the transcript");
        self.state = RelayState::CollectingShuffleSignatures;
        for trustee_id in 0..n_trustees {
            self.sender.send_to_trustee(trustee_id, transcript.clone())?;
        }
        Ok(())
    }

    pub(super) fn received_shuffle_signature(
        &mut self,
        trustee_id: u32,
        signature: Vec<u8>,
    ) -> PrifiResult<()> {
        let session = self.session_mut()?;
        let trustee_pk = session.trustee_pk(trustee_id)?;
        let shuffle = session
            .shuffle
            .as_mut()
            .ok_or(PrifiError::NotInitialized("relay shuffle"))?;
        match shuffle.received_signature(trustee_id, signature, &trustee_pk) {
            Ok(true) => self.start_communication(),
            Ok(false) => Ok(()),
            Err(err @ (PrifiError::DuplicateEntity(..) | PrifiError::UnknownEntity(..))) => Err(err),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(trustee_id, %err, "shuffle signature rejected");
                self.resync("invalid shuffle signature")
            }
        }
    }

    /// A client could not verify the shuffle it was handed.
    pub(super) fn received_shuffle_rejected(&mut self, client_id: u32) -> PrifiResult<()> {
        self.session_mut()?.client_keys(client_id)?;
        warn!(client_id, "client rejected the shuffle");
        self.resync("shuffle rejected by a client")
    }

    /// Open round 0 and hand the slots to the clients.
    fn start_communication(&mut self) -> PrifiResult<()> {
        let session = self.session_mut()?;
        let shuffle = session
            .shuffle
            .as_ref()
            .ok_or(PrifiError::NotInitialized("relay shuffle"))?;
        let final_message = shuffle.final_message()?;
        session.slot_keys = shuffle
            .final_keys()
            .ok_or(PrifiError::NotInitialized("slot keys"))?
            .to_vec();

        let round = session.rounds.open_next_round()?;
        session.round_owners.insert(round, None);
        session.dcnet.snapshot_history(round);
        session.dcnet.decode_start(round);
        session.non_acked = 1;
        let n_clients = session.config.n_clients as u32;
        let phase1 = session.config.relay.timeout_phase1();

        info!(round, "shuffle signed, communication starts");
        self.state = RelayState::Communicating;
        for client_id in 0..n_clients {
            self.sender.send_to_client(client_id, final_message.clone())?;
        }
        self.schedule(RelayEvent::TimeoutPhase1(round), phase1);
        Ok(())
    }
}
