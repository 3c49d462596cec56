// Copyright (c) 2024 The PriFi Authors

//! The communication phase: collecting ciphers, decoding rounds and opening
//! new ones.

use super::{stats, Relay, RelayEvent, RelayState};
use crate::{
    cells,
    dcnet::{disruption, downstream, DcNetEntity},
    error::{PrifiError, PrifiResult},
    messages::Message,
    scheduler::bitmask,
};
use std::{sync::atomic::Ordering, time::Duration};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

fn combine(
    dcnet: &mut DcNetEntity,
    round: u32,
    clients: &[Vec<u8>],
    trustees: &[Vec<u8>],
) -> PrifiResult<Vec<u8>> {
    for cipher in clients {
        dcnet.decode_client(round, cipher)?;
    }
    for cipher in trustees {
        dcnet.decode_trustee(round, cipher)?;
    }
    dcnet.decode_cell()
}

/// What a decoded round carried.
enum RoundContent {
    Schedule(Vec<u8>),
    Payload(Option<u32>, Vec<u8>),
    Lost,
}

impl Relay {
    pub(super) fn received_trustee_cipher(
        &mut self,
        round: u32,
        trustee_id: u32,
        data: Vec<u8>,
    ) -> PrifiResult<()> {
        self.session_mut()?
            .rounds
            .add_trustee_cipher(round, trustee_id, data)?;
        self.process_rounds(true)
    }

    pub(super) fn received_client_cipher(
        &mut self,
        round: u32,
        client_id: u32,
        data: Vec<u8>,
    ) -> PrifiResult<()> {
        self.session_mut()?
            .rounds
            .add_client_cipher(round, client_id, data)?;
        self.process_rounds(false)
    }

    /// Decode and finalize every complete round, then refill the window.
    pub(super) fn process_rounds(&mut self, finished_by_trustee: bool) -> PrifiResult<()> {
        if !matches!(self.state, RelayState::Communicating | RelayState::Blaming) {
            return Ok(());
        }
        loop {
            let session = self.session_mut()?;
            if !session.rounds.has_all_ciphers_for_current_round() {
                break;
            }
            let round = session
                .rounds
                .current_round()
                .ok_or(PrifiError::NoOpenRound)?;
            if let Some(waited) = session.rounds.time_spent_in_round(round) {
                let name = if finished_by_trustee {
                    stats::WAITING_ON_TRUSTEES
                } else {
                    stats::WAITING_ON_CLIENTS
                };
                session.stats.add_time(name, waited);
            }

            match self.decode_round(round)? {
                RoundContent::Schedule(cell) => self.received_schedule(round, &cell)?,
                RoundContent::Payload(owner, cell) => self.received_payload(round, owner, cell)?,
                RoundContent::Lost => {}
            }
            if self.finalize_round(round)? {
                return Ok(());
            }
        }
        self.send_many()
    }

    fn decode_round(&mut self, round: u32) -> PrifiResult<RoundContent> {
        let session = self.session_mut()?;
        let (clients, trustees) = session.rounds.collect_round_data()?;
        let decoded = combine(&mut session.dcnet, round, &clients, &trustees);

        let cell = match decoded {
            Ok(cell) => cell,
            Err(err) if !err.is_fatal() => {
                warn!(round, %err, "could not decode round, treating it as empty");
                return Ok(RoundContent::Lost);
            }
            Err(err) => return Err(err),
        };
        session.stats.bitrate.upstream_cells += 1;
        session.stats.bitrate.upstream_bytes += cell.len() as u64;

        if session.open_closed_rounds.contains(&round) {
            return Ok(RoundContent::Schedule(cell));
        }
        let owner = session.round_owners.get(&round).copied().flatten();
        Ok(RoundContent::Payload(owner, cell))
    }

    fn received_schedule(&mut self, round: u32, cell: &[u8]) -> PrifiResult<()> {
        let session = self.session_mut()?;
        let schedule = bitmask::schedule_from_cell(cell, session.config.n_clients);
        let open_slots = schedule.iter().filter(|&&open| open).count();
        session.rounds.set_stored_round_schedule(schedule);
        debug!(round, open_slots, "slot schedule decoded");

        if open_slots == 0 {
            let delay = session.config.relay.open_closed_slots_min_delay();
            if self.schedule(RelayEvent::ResumeAfterClosedSchedule, delay) {
                debug!(?delay, "every slot is closed, pausing");
                self.session_mut()?.paused = true;
            }
        }
        Ok(())
    }

    fn received_payload(&mut self, round: u32, owner: Option<u32>, cell: Vec<u8>) -> PrifiResult<()> {
        let Some(owner) = owner else {
            return Ok(());
        };
        let session = self.session_mut()?;
        let body = if session.config.disruption_protection {
            let slot_key = session
                .slot_keys
                .get(owner as usize)
                .ok_or(PrifiError::UnknownEntity("slot", owner))?;
            match disruption::open(slot_key, round, &cell) {
                Ok(body) => body,
                Err(err) => {
                    warn!(round, owner, %err, "slot payload failed its integrity check");
                    return Ok(());
                }
            }
        } else {
            cell
        };

        if cells::is_latency_probe(&body) {
            trace!(round, "echoing latency probe");
            self.priority_queue.push_back(body);
        } else if let Some(data) = cells::unframe_data(&body) {
            trace!(round, len = data.len(), "upstream data");
            self.upstream_out.push_back(data.to_vec());
        }
        Ok(())
    }

    /// Close `round`. Returns whether the experiment ended with it.
    fn finalize_round(&mut self, round: u32) -> PrifiResult<bool> {
        let session = self.session_mut()?;
        let duration = session.rounds.time_spent_in_round(round);
        session.rounds.close_round()?;
        if let Some(duration) = duration {
            session.stats.add_time(stats::ROUND_DURATION, duration);
        }
        session.non_acked = session.non_acked.saturating_sub(1);
        session.round_owners.remove(&round);
        session.open_closed_rounds.remove(&round);
        trace!(round, in_flight = session.non_acked, "round finalized");

        if session.config.experiment_round_limit == Some(round) {
            let reports = session.stats.reports();
            info!(round, "experiment round limit reached");
            self.results.extend(reports);
            self.experiment_results = Some(self.results.clone());
            self.shutdown();
            return Ok(true);
        }
        if let Some(next) = session.rounds.current_round() {
            session.dcnet.decode_start(next);
        }
        Ok(false)
    }

    /// Open rounds until the window is full.
    pub(super) fn send_many(&mut self) -> PrifiResult<()> {
        loop {
            if self.state != RelayState::Communicating {
                return Ok(());
            }
            let session = self.session_mut()?;
            let window = session.config.window_size;
            if session.paused || session.non_acked >= window || session.rounds.open_rounds() >= window {
                return Ok(());
            }
            if self.send_downstream()? {
                return self.resync("resync flagged downstream");
            }
        }
    }

    /// Open the next round with a downstream cell. Returns whether the cell
    /// told the clients to resync.
    fn send_downstream(&mut self) -> PrifiResult<bool> {
        let session = self
            .session
            .as_mut()
            .ok_or(PrifiError::NotInitialized("relay session"))?;
        let capacity = session.config.downstream_cell_size;
        let open_closed = session.config.relay.use_open_closed_slots
            && session.rounds.is_next_downstream_round_for_open_closed_request();

        // clients drop what a resync cell carries, so queued data waits
        let queued = if session.next_resync {
            None
        } else {
            self.priority_queue
                .pop_front()
                .or_else(|| self.downstream_queue.pop_front())
        };
        let mut data = queued.unwrap_or_else(|| cells::IDLE_DOWNSTREAM.to_vec());
        if session.config.use_dummy_data_down && data.len() < capacity {
            data.resize(capacity, 0);
        }

        let owner = if open_closed {
            None
        } else {
            session.rounds.update_and_get_next_owner_id()
        };
        let idle = session.rounds.current_round().is_none();
        let round = session.rounds.open_next_round()?;
        if open_closed {
            session.open_closed_rounds.insert(round);
        }
        session.round_owners.insert(round, owner);
        session.dcnet.record_downstream(round, &data);
        if idle {
            session.dcnet.decode_start(round);
        }

        let flag_resync = std::mem::take(&mut session.next_resync);
        let message = Message::DownstreamData {
            round_id: round,
            ownership_id: owner,
            data: data.clone(),
            flag_resync,
            flag_open_closed_request: open_closed,
        };
        session.rounds.set_data_already_sent(round, message.clone())?;
        session.non_acked += 1;

        if session.config.use_udp {
            self.sender.broadcast_to_clients(message.to_datagram()?)?;
            session.stats.bitrate.downstream_udp_cells += 1;
        } else {
            for (client_id, client) in session.clients.iter().enumerate() {
                let mut data = data.clone();
                if let Some(key) = client.as_ref().and_then(|c| c.downstream_key.as_ref()) {
                    downstream::apply(key, round, &mut data);
                }
                self.sender.send_to_client(
                    client_id as u32,
                    Message::DownstreamData {
                        round_id: round,
                        ownership_id: owner,
                        data,
                        flag_resync,
                        flag_open_closed_request: open_closed,
                    },
                )?;
            }
            session.stats.bitrate.downstream_cells += 1;
            session.stats.bitrate.downstream_bytes += data.len() as u64;
        }
        debug!(round, ?owner, open_closed, len = data.len(), "downstream cell sent");

        let phase1 = session.config.relay.timeout_phase1();
        self.schedule(RelayEvent::TimeoutPhase1(round), phase1);
        Ok(flag_resync)
    }

    /// Deliver `event` after `after`, unless the setup ran again meanwhile.
    /// Returns whether a timer was armed, which needs a timer channel and a
    /// tokio runtime.
    pub(super) fn schedule(&self, event: RelayEvent, after: Duration) -> bool {
        let Some(timers) = &self.timers else {
            return false;
        };
        let Ok(handle) = Handle::try_current() else {
            return false;
        };
        let timers = timers.clone();
        let generation = self.timer_generation.clone();
        let armed = generation.load(Ordering::Relaxed);
        handle.spawn(async move {
            tokio::time::sleep(after).await;
            if generation.load(Ordering::Relaxed) != armed {
                trace!(?event, "timer of an earlier session dropped");
            } else if timers.send(event).is_err() {
                debug!(?event, "relay stopped, timer event dropped");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PrifiConfig,
        sender::recording::{Destination, RecordingSender},
    };
    use prifi_crypto::KeyPair;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::Arc;

    /// A relay in the communicating state, driven with hand-built ciphers.
    struct Fixture {
        relay: Relay,
        sender: Arc<RecordingSender>,
        clients: Vec<DcNetEntity>,
        trustees: Vec<DcNetEntity>,
        rng: StdRng,
    }

    impl Fixture {
        fn new(config: PrifiConfig, seed: u64) -> Self {
            let mut rng = StdRng::seed_from_u64(seed);
            let sender = Arc::new(RecordingSender::default());
            let mut relay = Relay::new(sender.clone());
            relay
                .received_message(Message::Parameters(config.to_parameters()))
                .unwrap();

            let client_keys: Vec<_> = (0..config.n_clients)
                .map(|_| KeyPair::generate(&mut rng))
                .collect();
            let trustee_keys: Vec<_> = (0..config.n_trustees)
                .map(|_| KeyPair::generate(&mut rng))
                .collect();
            let clients = client_keys
                .iter()
                .map(|c| {
                    let secrets: Vec<_> =
                        trustee_keys.iter().map(|t| c.shared_secret(&t.public())).collect();
                    DcNetEntity::new_client(config.payload_size, &secrets, config.equivocation_protection)
                })
                .collect();
            let trustees = trustee_keys
                .iter()
                .map(|t| {
                    let secrets: Vec<_> =
                        client_keys.iter().map(|c| t.shared_secret(&c.public())).collect();
                    DcNetEntity::new_trustee(config.payload_size, &secrets, config.equivocation_protection)
                })
                .collect();

            // skip the shuffle: slot i belongs to client i
            let session = relay.session.as_mut().unwrap();
            session.slot_keys = client_keys.iter().map(KeyPair::public).collect();
            let round = session.rounds.open_next_round().unwrap();
            session.round_owners.insert(round, None);
            session.dcnet.snapshot_history(round);
            session.dcnet.decode_start(round);
            session.non_acked = 1;
            relay.state = RelayState::Communicating;
            sender.take();

            Self {
                relay,
                sender,
                clients,
                trustees,
                rng,
            }
        }

        /// Everything sent since the last call, without the trustees' rate
        /// notifications.
        fn sent(&self) -> Vec<(Destination, Message)> {
            self.sender
                .take()
                .into_iter()
                .filter(|(_, message)| !matches!(message, Message::RateChange { .. }))
                .collect()
        }

        /// Every client and trustee sends its cipher for `round`; `payloads`
        /// holds what each client owns, if anything.
        fn complete_round(&mut self, round: u32, payloads: &[Option<Vec<u8>>]) {
            for (j, trustee) in self.trustees.iter_mut().enumerate() {
                let data = trustee
                    .encode_for_round(round, false, &[], &mut self.rng)
                    .unwrap();
                self.relay
                    .received_message(Message::TrusteeCipher {
                        round_id: round,
                        trustee_id: j as u32,
                        data,
                    })
                    .unwrap();
            }
            for (i, client) in self.clients.iter_mut().enumerate() {
                let payload = payloads.get(i).cloned().flatten();
                let data = client
                    .encode_for_round(round, payload.is_some(), &payload.unwrap_or_default(), &mut self.rng)
                    .unwrap();
                self.relay
                    .received_message(Message::UpstreamData {
                        client_id: i as u32,
                        round_id: round,
                        data,
                    })
                    .unwrap();
            }
        }
    }

    fn downstream_rounds(sent: &[(Destination, Message)]) -> Vec<(u32, Option<u32>)> {
        sent.iter()
            .filter_map(|(to, message)| match (to, message) {
                (
                    Destination::Client(0),
                    Message::DownstreamData {
                        round_id,
                        ownership_id,
                        ..
                    },
                ) => Some((*round_id, *ownership_id)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_window_is_refilled_after_round_zero() {
        let config = PrifiConfig {
            n_clients: 2,
            n_trustees: 1,
            payload_size: 32,
            window_size: 3,
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 100);

        fixture.complete_round(0, &[]);
        assert_eq!(fixture.relay.current_round(), Some(1));
        assert_eq!(fixture.relay.rounds_in_flight(), 3);
        assert_eq!(
            downstream_rounds(&fixture.sent()),
            vec![(1, Some(0)), (2, Some(1)), (3, Some(0))]
        );
    }

    #[test]
    fn test_upstream_data_is_unframed() {
        let config = PrifiConfig {
            n_clients: 2,
            n_trustees: 2,
            payload_size: 32,
            equivocation_protection: true,
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 101);
        fixture.complete_round(0, &[]);
        fixture.sent();

        // round 1 belongs to client 0; the clients fold the cell into their history
        for client in &mut fixture.clients {
            client.update_history(&cells::IDLE_DOWNSTREAM);
        }
        let frame = cells::frame_data(b"hello", 32).unwrap();
        fixture.complete_round(1, &[Some(frame)]);
        assert_eq!(fixture.relay.take_upstream(), vec![b"hello".to_vec()]);
        assert_eq!(fixture.relay.current_round(), Some(2));
    }

    #[test]
    fn test_queued_downstream_data_goes_first_in_line() {
        let config = PrifiConfig {
            n_clients: 1,
            n_trustees: 1,
            payload_size: 32,
            downstream_cell_size: 64,
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 102);
        fixture.relay.queue_downstream(b"down").unwrap();
        fixture.complete_round(0, &[]);

        match fixture.sent().as_slice() {
            [(Destination::Client(0), Message::DownstreamData { round_id: 1, data, .. })] => {
                assert_eq!(cells::unframe_data(data), Some(&b"down"[..]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_idle_cell_is_a_single_byte() {
        let config = PrifiConfig {
            n_clients: 1,
            n_trustees: 1,
            payload_size: 32,
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 107);
        fixture.complete_round(0, &[]);

        match fixture.sent().as_slice() {
            [(_, Message::DownstreamData { data, flag_resync: false, .. })] => {
                assert_eq!(data, &cells::IDLE_DOWNSTREAM);
                assert_eq!(cells::unframe_data(data), None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dummy_data_pads_the_filler() {
        let config = PrifiConfig {
            n_clients: 1,
            n_trustees: 1,
            payload_size: 32,
            downstream_cell_size: 48,
            use_dummy_data_down: true,
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 103);
        fixture.complete_round(0, &[]);

        match fixture.sent().as_slice() {
            [(_, Message::DownstreamData { data, .. })] => {
                assert_eq!(data.len(), 48);
                assert!(data.iter().all(|&b| b == 0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_round_limit_shuts_the_session_down() {
        let config = PrifiConfig {
            n_clients: 1,
            n_trustees: 1,
            payload_size: 16,
            experiment_round_limit: Some(0),
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 104);
        fixture.complete_round(0, &[]);

        assert_eq!(fixture.relay.state(), RelayState::Shutdown);
        let results = fixture.relay.take_experiment_results().unwrap();
        assert!(results[0].starts_with("bitrate: 1 cells"));
        assert!(results.iter().any(|r| r.starts_with(stats::ROUND_DURATION)));
        assert!(fixture.relay.take_experiment_results().is_none());
        assert!(fixture
            .sent()
            .iter()
            .all(|(_, message)| *message == Message::Shutdown));
    }

    #[test]
    fn test_undecodable_round_is_skipped() {
        let config = PrifiConfig {
            n_clients: 1,
            n_trustees: 1,
            payload_size: 16,
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 105);
        fixture
            .relay
            .received_message(Message::TrusteeCipher {
                round_id: 0,
                trustee_id: 0,
                data: vec![1, 2, 3],
            })
            .unwrap();
        fixture
            .relay
            .received_message(Message::UpstreamData {
                client_id: 0,
                round_id: 0,
                data: vec![4, 5, 6],
            })
            .unwrap();

        assert_eq!(fixture.relay.current_round(), Some(1));
        assert!(fixture.relay.take_upstream().is_empty());
    }

    #[test]
    fn test_encrypted_downstream_differs_per_client() {
        let config = PrifiConfig {
            n_clients: 2,
            n_trustees: 1,
            payload_size: 16,
            downstream_traffic_encrypted: true,
            ..PrifiConfig::default()
        };
        let mut fixture = Fixture::new(config, 106);
        let keys: Vec<_> = (0..2)
            .map(|_| downstream::generate_key(&mut fixture.rng))
            .collect();
        let session = fixture.relay.session.as_mut().unwrap();
        for (slot, key) in session.clients.iter_mut().zip(&keys) {
            *slot = Some(super::super::ClientKeys {
                pk: KeyPair::generate(&mut fixture.rng).public(),
                eph_pk: KeyPair::generate(&mut fixture.rng).public(),
                downstream_key: Some(key.clone()),
            });
        }
        fixture.relay.queue_downstream(b"secret").unwrap();
        fixture.complete_round(0, &[]);

        let sent = fixture.sent();
        assert_eq!(sent.len(), 2);
        for ((to, message), key) in sent.into_iter().zip(&keys) {
            let Message::DownstreamData { round_id, mut data, .. } = message else {
                panic!("unexpected {to:?}");
            };
            downstream::apply(key, round_id, &mut data);
            assert_eq!(cells::unframe_data(&data), Some(&b"secret"[..]));
        }
    }
}
