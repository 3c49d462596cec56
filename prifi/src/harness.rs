// Copyright (c) 2024 The PriFi Authors

//! A whole session in one thread, for tests.
//!
//! Every role sends into its own [`RecordingSender`]; [`Harness::pump`] moves
//! the recorded messages to their recipients until nothing is left in flight.
//! Trustees run without a cipher loop and produce one cipher per
//! [`Harness::run_rounds`] step.

use crate::{
    client::Client,
    config::PrifiConfig,
    messages::Message,
    relay::Relay,
    sender::recording::{Destination, RecordingSender},
    trustee::Trustee,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{collections::VecDeque, sync::Arc};

/// Who sent a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Source {
    Relay,
    Client(u32),
    Trustee(u32),
}

pub(crate) struct Harness {
    pub relay: Relay,
    pub clients: Vec<Client>,
    pub trustees: Vec<Trustee>,
    relay_out: Arc<RecordingSender>,
    client_out: Vec<Arc<RecordingSender>>,
    trustee_out: Vec<Arc<RecordingSender>>,
    /// Errors returned by the roles while pumping
    pub errors: Vec<String>,
}

impl Harness {
    /// Roles for `config`, not started yet.
    pub fn new(config: &PrifiConfig, seed: u64) -> Self {
        let relay_out = Arc::new(RecordingSender::default());
        let client_out: Vec<_> = (0..config.n_clients)
            .map(|_| Arc::new(RecordingSender::default()))
            .collect();
        let trustee_out: Vec<_> = (0..config.n_trustees)
            .map(|_| Arc::new(RecordingSender::default()))
            .collect();

        let clients = client_out
            .iter()
            .enumerate()
            .map(|(i, out)| Client::with_rng(out.clone(), StdRng::seed_from_u64(seed + 1 + i as u64)))
            .collect();
        let trustees = trustee_out
            .iter()
            .enumerate()
            .map(|(j, out)| Trustee::with_rng(out.clone(), StdRng::seed_from_u64(seed + 1001 + j as u64)))
            .collect();

        Self {
            relay: Relay::new(relay_out.clone()),
            clients,
            trustees,
            relay_out,
            client_out,
            trustee_out,
            errors: Vec::new(),
        }
    }

    /// Roles for `config`, through the setup and the shuffle.
    pub fn started(config: &PrifiConfig, seed: u64) -> Self {
        let mut harness = Self::new(config, seed);
        harness.deliver(Source::Relay, Destination::Relay, Message::Parameters(config.to_parameters()));
        harness.pump();
        harness
    }

    fn collect(&self) -> VecDeque<(Source, Destination, Message)> {
        let mut out = VecDeque::new();
        out.extend(
            self.relay_out
                .take()
                .into_iter()
                .map(|(to, message)| (Source::Relay, to, message)),
        );
        for (i, sender) in self.client_out.iter().enumerate() {
            out.extend(
                sender
                    .take()
                    .into_iter()
                    .map(|(to, message)| (Source::Client(i as u32), to, message)),
            );
        }
        for (j, sender) in self.trustee_out.iter().enumerate() {
            out.extend(
                sender
                    .take()
                    .into_iter()
                    .map(|(to, message)| (Source::Trustee(j as u32), to, message)),
            );
        }
        out
    }

    fn deliver(&mut self, from: Source, to: Destination, message: Message) {
        let (recipient, result) = match to {
            Destination::Relay => ("relay".to_string(), self.relay.received_message(message)),
            Destination::Client(i) => match self.clients.get_mut(i as usize) {
                Some(client) => (format!("client {i}"), client.received_message(message)),
                None => return self.errors.push(format!("no client {i}")),
            },
            Destination::Trustee(j) => match self.trustees.get_mut(j as usize) {
                Some(trustee) => (format!("trustee {j}"), trustee.received_message(message)),
                None => return self.errors.push(format!("no trustee {j}")),
            },
            Destination::Broadcast => {
                for i in 0..self.clients.len() {
                    self.deliver(from, Destination::Client(i as u32), message.clone());
                }
                return;
            }
        };
        if let Err(err) = result {
            self.errors.push(format!("{recipient} (from {from:?}): {err}"));
        }
    }

    /// Deliver everything in flight, dropping what `keep` refuses.
    pub fn pump_with(&mut self, mut keep: impl FnMut(Source, &Message) -> bool) {
        loop {
            let pending = self.collect();
            if pending.is_empty() {
                return;
            }
            for (from, to, message) in pending {
                if keep(from, &message) {
                    self.deliver(from, to, message);
                }
            }
        }
    }

    /// Deliver everything in flight.
    pub fn pump(&mut self) {
        self.pump_with(|_, _| true);
    }

    /// Let every trustee send one cipher and pump, `rounds` times.
    pub fn run_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for (j, trustee) in self.trustees.iter_mut().enumerate() {
                if let Err(err) = trustee.produce_cipher() {
                    self.errors.push(format!("trustee {j} cipher: {err}"));
                }
            }
            self.pump();
        }
    }

    /// Downstream data delivered to client `i`.
    pub fn delivered(&mut self, client: usize) -> Vec<Vec<u8>> {
        self.clients[client].take_delivered()
    }

    /// Index of the client owning `slot`.
    pub fn client_in_slot(&self, slot: u32) -> usize {
        self.clients
            .iter()
            .position(|c| c.slot() == Some(slot))
            .unwrap_or_else(|| panic!("nobody owns slot {slot}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::ClientState,
        relay::{BlameVerdict, RelayEvent, RelayState},
        trustee::TrusteeState,
    };
    use std::collections::BTreeSet;

    fn config(n_clients: usize, n_trustees: usize) -> PrifiConfig {
        PrifiConfig {
            n_clients,
            n_trustees,
            payload_size: 64,
            downstream_cell_size: 256,
            ..PrifiConfig::default()
        }
    }

    /// Run until the relay decoded `count` upstream messages.
    fn run_until_upstream(harness: &mut Harness, count: usize, max_rounds: usize) -> Vec<Vec<u8>> {
        let mut upstream = Vec::new();
        for _ in 0..max_rounds {
            harness.run_rounds(1);
            upstream.extend(harness.relay.take_upstream());
            if upstream.len() >= count {
                break;
            }
        }
        upstream
    }

    #[test]
    fn test_setup_hands_out_a_permutation_of_slots() {
        let harness = Harness::started(&config(3, 2), 1);
        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert_eq!(harness.relay.state(), RelayState::Communicating);
        assert!(harness.clients.iter().all(|c| c.state() == ClientState::Ready));
        assert!(harness.trustees.iter().all(|t| t.state() == TrusteeState::Ready));

        let slots: BTreeSet<_> = harness.clients.iter().filter_map(Client::slot).collect();
        assert_eq!(slots, BTreeSet::from([0, 1, 2]));
        assert_eq!(harness.relay.slot_keys().len(), 3);
    }

    fn exchange_data(config: PrifiConfig, seed: u64) {
        let mut harness = Harness::started(&config, seed);
        harness.clients[1].queue_upstream(b"hello relay").unwrap();
        harness.relay.queue_downstream(b"hello clients").unwrap();

        let upstream = run_until_upstream(&mut harness, 1, 10);
        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert_eq!(upstream, vec![b"hello relay".to_vec()]);
        for client in 0..config.n_clients {
            assert_eq!(harness.delivered(client), vec![b"hello clients".to_vec()]);
        }
    }

    #[test]
    fn test_data_flows_both_ways() {
        exchange_data(config(3, 2), 2);
    }

    #[test]
    fn test_data_flows_with_equivocation_protection() {
        exchange_data(
            PrifiConfig {
                equivocation_protection: true,
                window_size: 2,
                ..config(3, 2)
            },
            3,
        );
    }

    #[test]
    fn test_data_flows_with_disruption_protection() {
        exchange_data(
            PrifiConfig {
                disruption_protection: true,
                ..config(2, 2)
            },
            4,
        );
    }

    #[test]
    fn test_data_flows_with_encrypted_downstream() {
        exchange_data(
            PrifiConfig {
                downstream_traffic_encrypted: true,
                ..config(2, 1)
            },
            5,
        );
    }

    #[test]
    fn test_data_flows_over_udp_with_dummy_data() {
        exchange_data(
            PrifiConfig {
                use_udp: true,
                use_dummy_data_down: true,
                ..config(2, 1)
            },
            6,
        );
    }

    #[test]
    fn test_long_messages_are_reassembled_in_order() {
        let mut harness = Harness::started(&config(2, 1), 7);
        let message: Vec<u8> = (0..200u8).collect();
        harness.clients[0].queue_upstream(&message).unwrap();
        let chunks = harness.clients[0].pending_upstream();
        assert!(chunks > 1);

        let upstream = run_until_upstream(&mut harness, chunks, 20);
        assert_eq!(upstream.concat(), message);
    }

    #[test]
    fn test_open_closed_schedule_gives_the_slot_to_the_sender() {
        let config = PrifiConfig {
            relay: crate::config::RelayConfig {
                use_open_closed_slots: true,
                ..Default::default()
            },
            ..config(4, 1)
        };
        let mut harness = Harness::started(&config, 8);
        let sender = harness.client_in_slot(2);
        harness.clients[sender].queue_upstream(b"reserved").unwrap();

        // round 1 collects the schedule, round 2 belongs to slot 2
        let upstream = run_until_upstream(&mut harness, 1, 3);
        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert_eq!(upstream, vec![b"reserved".to_vec()]);
        assert_eq!(harness.relay.current_round(), Some(3));
    }

    #[test]
    fn test_latency_probes_come_back() {
        let config = PrifiConfig {
            client: crate::config::ClientConfig {
                do_latency_tests: true,
                latency_tests_interval_ms: 0,
            },
            ..config(2, 1)
        };
        let mut harness = Harness::started(&config, 9);
        harness.run_rounds(6);
        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert!(!harness.clients[0].latencies().is_empty());
        assert!(!harness.clients[1].latencies().is_empty());
    }

    #[test]
    fn test_honest_blame_is_unfounded_and_rounds_resume() {
        let config = PrifiConfig {
            disruption_protection: true,
            ..config(2, 2)
        };
        let mut harness = Harness::started(&config, 10);
        harness.run_rounds(3);

        harness.clients[0].request_blame(2, 13).unwrap();
        harness.pump();
        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert_eq!(harness.relay.last_blame(), Some(BlameVerdict::Unfounded));
        assert_eq!(harness.relay.state(), RelayState::Communicating);

        let before = harness.relay.current_round();
        harness.run_rounds(2);
        assert!(harness.relay.current_round() > before);
    }

    #[test]
    fn test_silent_client_round_is_aborted() {
        let mut harness = Harness::started(&config(2, 1), 11);
        harness.run_rounds(1);

        // client 1 misses the cell opening the next round
        for trustee in &mut harness.trustees {
            trustee.produce_cipher().unwrap();
        }
        harness.pump_with(|from, _| from != Source::Client(1));
        let round = harness.relay.current_round().unwrap();
        harness.run_rounds(1);
        assert_eq!(harness.relay.current_round(), Some(round));

        harness.relay.handle_event(RelayEvent::TimeoutPhase1(round)).unwrap();
        harness.relay.handle_event(RelayEvent::TimeoutPhase2(round)).unwrap();
        harness.pump();
        assert_eq!(harness.relay.results(), [format!("!!aborted-round-{round}")]);

        // the abort triggers a resync, and the new session starts at round 0
        assert_eq!(harness.relay.resyncs(), 1);
        assert_eq!(harness.relay.state(), RelayState::Communicating);
        assert!(harness.clients.iter().all(|c| c.state() == ClientState::Ready));
        harness.run_rounds(2);
        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert_eq!(harness.relay.current_round(), Some(2));
    }

    #[test]
    fn test_round_limit_ends_the_session() {
        let config = PrifiConfig {
            experiment_round_limit: Some(4),
            ..config(2, 2)
        };
        let mut harness = Harness::started(&config, 12);
        harness.run_rounds(8);

        assert_eq!(harness.relay.state(), RelayState::Shutdown);
        assert!(harness.clients.iter().all(|c| c.state() == ClientState::Shutdown));
        assert!(harness.trustees.iter().all(|t| t.state() == TrusteeState::Shutdown));
        let results = harness.relay.take_experiment_results().unwrap();
        assert!(results.iter().any(|r| r.starts_with("round-duration")));
    }

    /// Everyone is back in business and data flows again.
    fn assert_session_resumed(harness: &mut Harness, resyncs: u32) {
        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert_eq!(harness.relay.resyncs(), resyncs);
        assert_eq!(harness.relay.state(), RelayState::Communicating);
        assert!(harness.clients.iter().all(|c| c.state() == ClientState::Ready));
        assert!(harness.trustees.iter().all(|t| t.state() == TrusteeState::Ready));

        harness.clients[0].queue_upstream(b"after resync").unwrap();
        let upstream = run_until_upstream(harness, 1, 10);
        assert_eq!(upstream, vec![b"after resync".to_vec()]);
    }

    #[test]
    fn test_requested_resync_runs_the_setup_again() {
        let mut harness = Harness::started(&config(2, 1), 13);
        harness.run_rounds(1);
        let slots_before = harness.relay.slot_keys().to_vec();

        harness.relay.request_resync().unwrap();
        harness.run_rounds(1);
        assert_ne!(harness.relay.slot_keys(), slots_before.as_slice());
        assert_session_resumed(&mut harness, 1);
    }

    #[test]
    fn test_resync_keeps_queued_data() {
        let mut harness = Harness::started(&config(2, 1), 14);
        harness.run_rounds(1);
        harness.relay.queue_downstream(b"still coming").unwrap();
        harness.relay.request_resync().unwrap();
        harness.run_rounds(3);

        assert!(harness.errors.is_empty(), "{:?}", harness.errors);
        assert_eq!(harness.relay.resyncs(), 1);
        for client in 0..2 {
            assert_eq!(harness.delivered(client), vec![b"still coming".to_vec()]);
        }
    }

    #[test]
    fn test_bad_trustee_signature_restarts_the_shuffle() {
        let config = config(2, 2);
        let mut harness = Harness::new(&config, 15);
        harness.deliver(Source::Relay, Destination::Relay, Message::Parameters(config.to_parameters()));
        harness.pump_with(|from, message| {
            !(from == Source::Trustee(0) && matches!(message, Message::TrusteeShuffleSig { .. }))
        });
        assert_eq!(harness.relay.state(), RelayState::CollectingShuffleSignatures);

        harness.deliver(
            Source::Trustee(0),
            Destination::Relay,
            Message::TrusteeShuffleSig {
                trustee_id: 0,
                sig: vec![3; 64],
            },
        );
        harness.pump();
        assert_session_resumed(&mut harness, 1);
    }

    #[test]
    fn test_client_rejecting_the_shuffle_restarts_it() {
        let config = config(2, 1);
        let mut harness = Harness::new(&config, 16);
        harness.deliver(Source::Relay, Destination::Relay, Message::Parameters(config.to_parameters()));

        let mut handed_out = None;
        harness.pump_with(|_, message| match message {
            Message::TellEphPksAndTrusteesSig { .. } => {
                handed_out = Some(message.clone());
                false
            }
            _ => true,
        });
        assert_eq!(harness.relay.state(), RelayState::Communicating);
        let Some(Message::TellEphPksAndTrusteesSig {
            base,
            mut eph_pks,
            trustee_sigs,
        }) = handed_out
        else {
            panic!("no shuffle handed out");
        };

        // reordered keys no longer match the trustees' signatures
        eph_pks.reverse();
        harness.deliver(
            Source::Relay,
            Destination::Client(0),
            Message::TellEphPksAndTrusteesSig {
                base,
                eph_pks,
                trustee_sigs,
            },
        );
        harness.pump();
        assert_session_resumed(&mut harness, 1);
    }
}
