// Copyright (c) 2024 The PriFi Authors

//! The trustee role.
//!
//! A trustee shares one keystream with every client, takes part in the
//! shuffle of the clients' ephemeral keys, and from then on streams its
//! ciphers to the relay without waiting for it.

pub mod cipher_loop;

use crate::{
    config::{keys, Parameters, PrifiConfig},
    dcnet::{disruption, DcNetEntity},
    error::{PrifiError, PrifiResult},
    messages::Message,
    scheduler::TrusteeShuffleView,
    sender::SharedSender,
};
use cipher_loop::{CipherLoopConfig, SendRate};
use displaydoc::Display;
use parking_lot::Mutex;
use prifi_crypto::{KeyPair, RistrettoPoint};
use rand::{rngs::StdRng, SeedableRng};
use std::{sync::Arc, time::Duration};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

/// Protocol state of a trustee.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum TrusteeState {
    /// BEFORE_INIT
    BeforeInit,
    /// INITIALIZING
    Initializing,
    /// SHUFFLE_DONE
    ShuffleDone,
    /// READY
    Ready,
    /// SHUTDOWN
    Shutdown,
}

/// Everything a trustee learns during setup.
#[derive(Debug)]
struct Session {
    id: u32,
    config: PrifiConfig,
    keys: KeyPair,
    client_pks: Vec<RistrettoPoint>,
    shared_secrets: Vec<RistrettoPoint>,
    dcnet: Option<Arc<Mutex<DcNetEntity>>>,
    shuffle: TrusteeShuffleView,
}

/// A trustee's state machine.
#[derive(Debug)]
pub struct Trustee {
    state: TrusteeState,
    sender: SharedSender,
    rng: StdRng,
    session: Option<Session>,
    rate: Option<watch::Sender<SendRate>>,
    cipher_loop: Option<JoinHandle<()>>,
    next_round: u32,
}

impl Trustee {
    /// A trustee waiting for its parameters.
    pub fn new(sender: SharedSender) -> Self {
        Self::with_rng(sender, StdRng::from_entropy())
    }

    /// A trustee drawing its keys from `rng`.
    pub fn with_rng(sender: SharedSender, rng: StdRng) -> Self {
        Self {
            state: TrusteeState::BeforeInit,
            sender,
            rng,
            session: None,
            rate: None,
            cipher_loop: None,
            next_round: 0,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> TrusteeState {
        self.state
    }

    /// Assigned trustee id, once parameters were received.
    pub fn id(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Long-term public key, once parameters were received.
    pub fn public_key(&self) -> Option<RistrettoPoint> {
        self.session.as_ref().map(|s| s.keys.public())
    }

    /// Requested cipher rate, once ready.
    pub fn send_rate(&self) -> Option<SendRate> {
        self.rate.as_ref().map(|rate| *rate.borrow())
    }

    fn unexpected(&self, message: &Message) -> PrifiError {
        PrifiError::UnexpectedMessage {
            message: message.name(),
            state: self.state.to_string(),
        }
    }

    fn session(&self) -> PrifiResult<&Session> {
        self.session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("trustee session"))
    }

    /// Handle one message from the relay.
    pub fn received_message(&mut self, message: Message) -> PrifiResult<()> {
        use TrusteeState::*;

        match (self.state, message) {
            (Shutdown, _) => Ok(()),
            (_, Message::Shutdown) => {
                info!(trustee_id = ?self.id(), "shutting down");
                self.kill_cipher_loop();
                self.state = Shutdown;
                Ok(())
            }
            (BeforeInit, Message::Parameters(params)) => self.received_parameters(params),
            (_, Message::Parameters(params)) if params.force_params => {
                self.received_parameters(params)
            }
            (Initializing, Message::TellClientsPksAndEphPksAndBase { pks, eph_pks, base }) => {
                self.received_client_keys(pks, eph_pks, base)
            }
            (
                ShuffleDone,
                Message::TellTranscript {
                    input_base,
                    input_eph_pks,
                    bases,
                    eph_pks,
                    proofs,
                },
            ) => self.received_transcript(input_base, input_eph_pks, bases, eph_pks, proofs),
            (Ready, Message::RateChange { window_capacity }) => {
                self.received_rate_change(window_capacity);
                Ok(())
            }
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
        if params.force_params {
            self.kill_cipher_loop();
            self.next_round = 0;
        }
        let config = PrifiConfig::from_parameters(&params)?;
        let id = params.int_or(keys::NEXT_FREE_TRUSTEE_ID, -1);
        let id = u32::try_from(id)
            .ok()
            .filter(|&id| (id as usize) < config.n_trustees)
            .ok_or_else(|| PrifiError::InvalidParameters(format!("trustee id {id}")))?;

        let keys = KeyPair::generate(&mut self.rng);
        let pk = keys.public();
        self.session = Some(Session {
            id,
            config,
            keys,
            client_pks: Vec::new(),
            shared_secrets: Vec::new(),
            dcnet: None,
            shuffle: TrusteeShuffleView::default(),
        });
        self.state = TrusteeState::Initializing;
        info!(trustee_id = id, "parameters received");

        self.sender
            .send_to_relay(Message::TrusteeTellPk { trustee_id: id, pk })
    }

    fn received_client_keys(
        &mut self,
        pks: Vec<RistrettoPoint>,
        eph_pks: Vec<RistrettoPoint>,
        base: RistrettoPoint,
    ) -> PrifiResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(PrifiError::NotInitialized("trustee session"))?;
        if pks.len() != session.config.n_clients || eph_pks.len() != session.config.n_clients {
            return Err(PrifiError::MalformedMessage(format!(
                "{} client keys and {} ephemeral keys for {} clients",
                pks.len(),
                eph_pks.len(),
                session.config.n_clients
            )));
        }

        session.shared_secrets = pks.iter().map(|pk| session.keys.shared_secret(pk)).collect();
        session.client_pks = pks;
        session.dcnet = Some(Arc::new(Mutex::new(DcNetEntity::new_trustee(
            session.config.payload_size,
            &session.shared_secrets,
            session.config.equivocation_protection,
        ))));

        let (new_base, new_eph_pks, proof) =
            session.shuffle.shuffle(&base, &eph_pks, &mut self.rng)?;
        let trustee_id = session.id;
        self.state = TrusteeState::ShuffleDone;
        debug!(trustee_id, "shuffle done");

        self.sender.send_to_relay(Message::TrusteeTellNewBaseAndEphPks {
            trustee_id,
            new_base,
            new_eph_pks,
            proof,
            vkey: Vec::new(),
        })
    }

    fn received_transcript(
        &mut self,
        input_base: RistrettoPoint,
        input_eph_pks: Vec<RistrettoPoint>,
        bases: Vec<RistrettoPoint>,
        eph_pks: Vec<Vec<RistrettoPoint>>,
        proofs: Vec<Vec<u8>>,
    ) -> PrifiResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("trustee session"))?;
        let sig = session.shuffle.verify_transcript_and_sign(
            session.keys.private(),
            &input_base,
            &input_eph_pks,
            &bases,
            &eph_pks,
            &proofs,
            &mut self.rng,
        )?;
        let trustee_id = session.id;

        self.sender
            .send_to_relay(Message::TrusteeShuffleSig { trustee_id, sig })?;
        self.state = TrusteeState::Ready;
        info!(trustee_id, "transcript signed, ready");
        self.start_cipher_loop()
    }

    fn start_cipher_loop(&mut self) -> PrifiResult<()> {
        let session = self.session()?;
        let dcnet = session
            .dcnet
            .clone()
            .ok_or(PrifiError::NotInitialized("trustee DC-net"))?;
        let config = CipherLoopConfig {
            trustee_id: session.id,
            base_sleep_time: Duration::from_millis(session.config.trustee.base_sleep_time_ms),
            never_slow_down: session.config.trustee.never_slow_down,
        };

        let (rate_tx, rate_rx) = watch::channel(SendRate::Active);
        self.rate = Some(rate_tx);
        self.next_round = 0;

        // Without a runtime the host drives the ciphers with `produce_cipher`.
        if Handle::try_current().is_ok() {
            self.cipher_loop = Some(cipher_loop::spawn(
                dcnet,
                self.sender.clone(),
                rate_rx,
                config,
            ));
        } else {
            debug!(trustee_id = config.trustee_id, "no runtime, ciphers are produced on demand");
        }
        Ok(())
    }

    fn kill_cipher_loop(&mut self) {
        if let Some(rate) = self.rate.take() {
            let _ = rate.send(SendRate::Killed);
        }
        if let Some(handle) = self.cipher_loop.take() {
            handle.abort();
        }
    }

    /// Send the cipher of the next round when no cipher loop runs.
    ///
    /// Returns `false` once the relay killed the stream or the trustee is not
    /// ready.
    pub fn produce_cipher(&mut self) -> PrifiResult<bool> {
        let running = matches!(self.send_rate(), Some(SendRate::Active | SendRate::Halved));
        if self.state != TrusteeState::Ready || self.cipher_loop.is_some() || !running {
            return Ok(false);
        }
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("trustee session"))?;
        let dcnet = session
            .dcnet
            .as_ref()
            .ok_or(PrifiError::NotInitialized("trustee DC-net"))?;
        let message = cipher_loop::next_cipher(dcnet, session.id, self.next_round, &mut self.rng)?;
        self.sender.send_to_relay(message)?;
        self.next_round += 1;
        Ok(true)
    }

    fn received_rate_change(&mut self, window_capacity: u32) {
        let rate = if window_capacity == 0 {
            SendRate::Halved
        } else {
            SendRate::Active
        };
        debug!(trustee_id = ?self.id(), ?rate, "rate change");
        if let Some(sender) = &self.rate {
            sender.send_replace(rate);
        }
    }

    fn received_reveal_request(&mut self, round: u32, bit_pos: u32) -> PrifiResult<()> {
        let session = self.session()?;
        let bits = disruption::reveal_bits(
            &session.shared_secrets,
            round,
            session.config.payload_size,
            bit_pos,
        );
        info!(trustee_id = session.id, round, bit_pos, "revealing pad bits");
        self.sender.send_to_relay(Message::TrusteeDisruptionReveal {
            trustee_id: session.id,
            bits,
        })
    }

    fn received_secret_request(&mut self, client_id: u32) -> PrifiResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(PrifiError::NotInitialized("trustee session"))?;
        let peer = session
            .client_pks
            .get(client_id as usize)
            .ok_or(PrifiError::UnknownEntity("client", client_id))?;
        warn!(trustee_id = session.id, client_id, "revealing shared secret");
        let (secret, proof) =
            disruption::reveal_shared_secret(session.keys.private(), peer, &mut self.rng);
        self.sender.send_to_relay(Message::TrusteeDisruptionSecret {
            trustee_id: session.id,
            client_id,
            secret,
            proof,
        })
    }
}

impl Drop for Trustee {
    fn drop(&mut self) {
        self.kill_cipher_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::recording::{Destination, RecordingSender};
    use prifi_crypto::KeyPair;
    use rand_chacha::ChaCha20Rng;

    fn params(n_clients: usize, trustee_id: i64) -> Parameters {
        let mut params = PrifiConfig {
            n_clients,
            n_trustees: 2,
            payload_size: 8,
            ..PrifiConfig::default()
        }
        .to_parameters();
        params.set_int(keys::NEXT_FREE_TRUSTEE_ID, trustee_id);
        params
    }

    fn trustee(seed: u64) -> (Trustee, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let trustee = Trustee::with_rng(sender.clone(), StdRng::seed_from_u64(seed));
        (trustee, sender)
    }

    #[test]
    fn test_parameters_send_public_key() {
        let (mut trustee, sender) = trustee(1);
        trustee.received_message(Message::Parameters(params(1, 1))).unwrap();

        assert_eq!(trustee.state(), TrusteeState::Initializing);
        assert_eq!(trustee.id(), Some(1));
        let sent = sender.take();
        assert_eq!(
            sent,
            vec![(
                Destination::Relay,
                Message::TrusteeTellPk {
                    trustee_id: 1,
                    pk: trustee.public_key().unwrap(),
                }
            )]
        );

        let err = trustee
            .received_message(Message::Parameters(params(1, 1)))
            .unwrap_err();
        assert!(matches!(err, PrifiError::UnexpectedMessage { .. }));
    }

    #[test]
    fn test_out_of_range_id_is_rejected() {
        let (mut trustee, _) = trustee(2);
        assert!(trustee
            .received_message(Message::Parameters(params(1, 2)))
            .is_err());
        assert_eq!(trustee.state(), TrusteeState::BeforeInit);
    }

    #[test]
    fn test_setup_to_ready_and_ciphers() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (mut trustee, sender) = trustee(3);
        let mut p = params(2, 0);
        p.set_int(keys::N_TRUSTEES, 1);
        trustee.received_message(Message::Parameters(p)).unwrap();
        sender.take();

        let clients: Vec<_> = (0..2).map(|_| KeyPair::generate(&mut rng)).collect();
        let ephs: Vec<_> = (0..2).map(|_| KeyPair::generate(&mut rng).public()).collect();
        let base = curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
        trustee
            .received_message(Message::TellClientsPksAndEphPksAndBase {
                pks: clients.iter().map(KeyPair::public).collect(),
                eph_pks: ephs.clone(),
                base,
            })
            .unwrap();
        assert_eq!(trustee.state(), TrusteeState::ShuffleDone);

        let (new_base, new_keys, proof) = match sender.take().pop() {
            Some((
                Destination::Relay,
                Message::TrusteeTellNewBaseAndEphPks {
                    new_base,
                    new_eph_pks,
                    proof,
                    vkey,
                    ..
                },
            )) => {
                assert!(vkey.is_empty());
                (new_base, new_eph_pks, proof)
            }
            other => panic!("unexpected {other:?}"),
        };

        trustee
            .received_message(Message::TellTranscript {
                input_base: base,
                input_eph_pks: ephs,
                bases: vec![new_base],
                eph_pks: vec![new_keys],
                proofs: vec![proof],
            })
            .unwrap();
        assert_eq!(trustee.state(), TrusteeState::Ready);
        assert!(matches!(
            sender.take().as_slice(),
            [(Destination::Relay, Message::TrusteeShuffleSig { trustee_id: 0, .. })]
        ));

        assert!(trustee.produce_cipher().unwrap());
        assert!(trustee.produce_cipher().unwrap());
        let rounds: Vec<_> = sender
            .take()
            .into_iter()
            .map(|(_, message)| match message {
                Message::TrusteeCipher { round_id, .. } => round_id,
                other => panic!("unexpected {}", other.name()),
            })
            .collect();
        assert_eq!(rounds, vec![0, 1]);

        trustee
            .received_message(Message::RateChange { window_capacity: 0 })
            .unwrap();
        assert_eq!(trustee.send_rate(), Some(SendRate::Halved));
        trustee
            .received_message(Message::RateChange { window_capacity: 3 })
            .unwrap();
        assert_eq!(trustee.send_rate(), Some(SendRate::Active));

        trustee.received_message(Message::Shutdown).unwrap();
        assert_eq!(trustee.state(), TrusteeState::Shutdown);
        assert!(!trustee.produce_cipher().unwrap());
        // ignored after shutdown
        trustee
            .received_message(Message::RateChange { window_capacity: 3 })
            .unwrap();
    }

    #[test]
    fn test_transcript_before_shuffle_is_rejected() {
        let (mut trustee, _) = trustee(4);
        trustee.received_message(Message::Parameters(params(1, 0))).unwrap();
        let base = curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
        let err = trustee
            .received_message(Message::TellTranscript {
                input_base: base,
                input_eph_pks: vec![],
                bases: vec![],
                eph_pks: vec![],
                proofs: vec![],
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Message REL_TRU_TELL_TRANSCRIPT is not accepted in state INITIALIZING"
        );
    }

    #[test]
    fn test_force_params_restart_setup() {
        let (mut trustee, sender) = trustee(5);
        trustee.received_message(Message::Parameters(params(1, 0))).unwrap();
        let first = trustee.public_key();

        let mut forced = params(1, 1);
        forced.force_params = true;
        trustee.received_message(Message::Parameters(forced)).unwrap();
        assert_eq!(trustee.id(), Some(1));
        assert_ne!(trustee.public_key(), first);
        assert_eq!(sender.take().len(), 2);
    }
}
