// Copyright (c) 2024 The PriFi Authors

//! Round timeouts.
//!
//! Every downstream cell arms a phase 1 timer. If its round is still open
//! when it fires, a lost broadcast is assumed and the cell is sent again over
//! the stream connection of every client that has not answered; then phase 2
//! is armed. A round still open and current after phase 2
//! is given up: it is closed with whatever arrived, the host is told who
//! was missing, and the next downstream cell asks for a resync.

use super::{Relay, RelayEvent, RelayState};
use crate::error::{PrifiError, PrifiResult};
use tracing::{debug, info, warn};

impl Relay {
    /// Handle a timer event armed by the relay itself.
    pub fn handle_event(&mut self, event: RelayEvent) -> PrifiResult<()> {
        if self.state == RelayState::Shutdown {
            return Ok(());
        }
        match event {
            RelayEvent::TimeoutPhase1(round) => self.timeout_phase1(round),
            RelayEvent::TimeoutPhase2(round) => self.timeout_phase2(round),
            RelayEvent::ResumeAfterClosedSchedule => {
                self.session_mut()?.paused = false;
                debug!("resuming after a closed schedule");
                self.send_many()
            }
        }
    }

    fn timeout_phase1(&mut self, round: u32) -> PrifiResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(PrifiError::NotInitialized("relay session"))?;
        if !session.rounds.is_round_open(round) {
            return Ok(());
        }
        if session.config.use_udp {
            if let Some(message) = session.rounds.data_already_sent(round) {
                let stragglers = if session.rounds.current_round() == Some(round) {
                    session.rounds.missing_ciphers_for_current_round().0
                } else {
                    (0..session.config.n_clients as u32).collect()
                };
                info!(round, ?stragglers, "round still open, resending its cell over the stream");
                for &client_id in &stragglers {
                    self.sender.send_to_client(client_id, message.clone())?;
                }
                session.stats.bitrate.retransmitted_cells += stragglers.len() as u64;
            }
        }
        let phase2 = session.config.relay.timeout_phase2();
        self.schedule(RelayEvent::TimeoutPhase2(round), phase2);
        Ok(())
    }

    fn timeout_phase2(&mut self, round: u32) -> PrifiResult<()> {
        let session = self.session_mut()?;
        if !session.rounds.is_round_open(round) {
            return Ok(());
        }
        if session.rounds.current_round() != Some(round) {
            // an older round holds it back; give it the same time again
            let phase2 = session.config.relay.timeout_phase2();
            self.schedule(RelayEvent::TimeoutPhase2(round), phase2);
            return Ok(());
        }
        self.abort_current_round(round)
    }

    /// Give up on `round`, the current round, and move on.
    fn abort_current_round(&mut self, round: u32) -> PrifiResult<()> {
        let session = self.session_mut()?;
        let (missing_clients, missing_trustees) = session.rounds.missing_ciphers_for_current_round();
        warn!(
            round,
            ?missing_clients,
            ?missing_trustees,
            "round timed out, aborting it"
        );

        session.rounds.force_close_round()?;
        session.non_acked = session.non_acked.saturating_sub(1);
        session.round_owners.remove(&round);
        session.open_closed_rounds.remove(&round);
        if let Some(next) = session.rounds.current_round() {
            session.dcnet.decode_start(next);
        }
        session.next_resync = true;

        self.results.push(format!("!!aborted-round-{round}"));
        if let Some(handler) = &self.timeout_handler {
            handler(&missing_clients, &missing_trustees);
        }
        self.process_rounds(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PrifiConfig,
        messages::Message,
        sender::recording::{Destination, RecordingSender},
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn communicating(config: PrifiConfig) -> (Relay, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let mut relay = Relay::new(sender.clone());
        relay
            .received_message(Message::Parameters(config.to_parameters()))
            .unwrap();
        let session = relay.session.as_mut().unwrap();
        let round = session.rounds.open_next_round().unwrap();
        session.round_owners.insert(round, None);
        session.dcnet.snapshot_history(round);
        session.dcnet.decode_start(round);
        session.non_acked = 1;
        relay.state = RelayState::Communicating;
        sender.take();
        (relay, sender)
    }

    fn downstream_cells(sent: &[(Destination, Message)]) -> usize {
        sent.iter()
            .filter(|(_, message)| matches!(message, Message::DownstreamData { .. }))
            .count()
    }

    #[test]
    fn test_phase2_aborts_the_current_round() {
        let config = PrifiConfig {
            n_clients: 2,
            n_trustees: 2,
            payload_size: 16,
            ..PrifiConfig::default()
        };
        let (mut relay, sender) = communicating(config);
        let missing = Arc::new(Mutex::new(None));
        let seen = missing.clone();
        relay.set_timeout_handler(Box::new(move |clients, trustees| {
            *seen.lock() = Some((clients.to_vec(), trustees.to_vec()));
        }));
        relay
            .received_message(Message::UpstreamData {
                client_id: 1,
                round_id: 0,
                data: vec![7; 8],
            })
            .unwrap();

        relay.handle_event(RelayEvent::TimeoutPhase1(0)).unwrap();
        assert_eq!(relay.current_round(), Some(0));
        relay.handle_event(RelayEvent::TimeoutPhase2(0)).unwrap();

        assert_eq!(*missing.lock(), Some((vec![0], vec![0, 1])));
        assert_eq!(relay.results(), ["!!aborted-round-0".to_string()]);

        // one flagged cell per client, then fresh parameters for everyone
        let sent = sender.take();
        let flags: Vec<_> = sent
            .iter()
            .filter_map(|(_, message)| match message {
                Message::DownstreamData {
                    round_id: 1,
                    flag_resync,
                    ..
                } => Some(*flag_resync),
                _ => None,
            })
            .collect();
        assert_eq!(flags, [true, true]);
        let forced = sent
            .iter()
            .filter(|(_, message)| matches!(message, Message::Parameters(p) if p.force_params))
            .count();
        assert_eq!(forced, 4);

        assert_eq!(relay.resyncs(), 1);
        assert_eq!(relay.state(), RelayState::CollectingTrusteesPks);
        assert_eq!(relay.current_round(), None);
        assert_eq!(relay.rounds_in_flight(), 0);
    }

    #[test]
    fn test_timeouts_of_closed_rounds_are_ignored() {
        let (mut relay, sender) = communicating(PrifiConfig::default());
        relay.handle_event(RelayEvent::TimeoutPhase2(5)).unwrap();
        relay.handle_event(RelayEvent::TimeoutPhase1(5)).unwrap();
        assert!(relay.results().is_empty());
        assert_eq!(relay.current_round(), Some(0));
        assert!(sender.take().is_empty());
    }

    #[test]
    fn test_phase1_resends_to_stragglers_over_udp() {
        let config = PrifiConfig {
            n_clients: 2,
            use_udp: true,
            payload_size: 16,
            ..PrifiConfig::default()
        };
        let (mut relay, sender) = communicating(config);
        // round 0 completes with ciphers that do not decode, opening round 1
        relay
            .received_message(Message::TrusteeCipher {
                round_id: 0,
                trustee_id: 0,
                data: vec![1],
            })
            .unwrap();
        sender.take();
        for client_id in 0..2 {
            relay
                .received_message(Message::UpstreamData {
                    client_id,
                    round_id: 0,
                    data: vec![0; 8],
                })
                .unwrap();
        }
        let cell = match sender.take().as_slice() {
            [(Destination::Broadcast, message @ Message::DownstreamData { round_id: 1, .. })] => {
                message.clone()
            }
            other => panic!("unexpected {other:?}"),
        };

        relay
            .received_message(Message::UpstreamData {
                client_id: 1,
                round_id: 1,
                data: vec![0; 8],
            })
            .unwrap();
        relay.handle_event(RelayEvent::TimeoutPhase1(1)).unwrap();
        assert_eq!(sender.take(), [(Destination::Client(0), cell)]);
        assert_eq!(relay.session.as_ref().unwrap().stats.bitrate.retransmitted_cells, 1);
    }

    #[test]
    fn test_closed_schedule_pause_ends_on_resume() {
        let (mut relay, sender) = communicating(PrifiConfig {
            window_size: 2,
            ..PrifiConfig::default()
        });
        relay.session.as_mut().unwrap().paused = true;
        relay.send_many().unwrap();
        assert_eq!(downstream_cells(&sender.take()), 0);

        relay.handle_event(RelayEvent::ResumeAfterClosedSchedule).unwrap();
        assert_eq!(downstream_cells(&sender.take()), 1);
        assert_eq!(relay.current_round(), Some(0));
        assert_eq!(relay.rounds_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_timers_of_an_earlier_session_are_dropped() {
        let (mut relay, _) = communicating(PrifiConfig {
            window_size: 2,
            ..PrifiConfig::default()
        });
        let (timers, mut events) = tokio::sync::mpsc::unbounded_channel();
        relay.set_timer_channel(timers);

        let after = std::time::Duration::from_millis(1);
        assert!(relay.schedule(RelayEvent::TimeoutPhase1(0), after));
        relay.request_resync().unwrap();
        relay.send_many().unwrap();
        assert_eq!(relay.resyncs(), 1);
        assert!(relay.schedule(RelayEvent::TimeoutPhase2(7), after));

        assert_eq!(events.recv().await, Some(RelayEvent::TimeoutPhase2(7)));
        relay.shutdown();
        drop(relay);
        assert_eq!(events.recv().await, None);
    }
}
