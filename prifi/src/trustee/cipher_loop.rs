// Copyright (c) 2024 The PriFi Authors

//! The trustee's cipher producer.
//!
//! Trustee ciphers do not depend on anything the relay sends, so once the
//! shuffle is signed a trustee streams them for rounds `0, 1, 2, ...` at the
//! pace set by the relay's rate changes.

use crate::{
    dcnet::DcNetEntity,
    error::PrifiResult,
    messages::Message,
    sender::SharedSender,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use rand_core::CryptoRngCore;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error};

/// Sending mode requested by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendRate {
    /// One cipher per base sleep time
    Active,
    /// Half of the active rate
    Halved,
    /// Stop for good
    Killed,
}

/// The next cipher of a trustee.
pub fn next_cipher<R: CryptoRngCore + ?Sized>(
    dcnet: &Mutex<DcNetEntity>,
    trustee_id: u32,
    round: u32,
    rng: &mut R,
) -> PrifiResult<Message> {
    let data = dcnet.lock().encode_for_round(round, false, &[], rng)?;
    Ok(Message::TrusteeCipher {
        round_id: round,
        trustee_id,
        data,
    })
}

/// Settings of a cipher loop.
#[derive(Clone, Copy, Debug)]
pub struct CipherLoopConfig {
    /// Trustee sending the ciphers
    pub trustee_id: u32,
    /// Pause after every cipher
    pub base_sleep_time: Duration,
    /// Ignore [`SendRate::Halved`]
    pub never_slow_down: bool,
}

/// Spawn the producer on the current runtime.
pub fn spawn(
    dcnet: Arc<Mutex<DcNetEntity>>,
    sender: SharedSender,
    rate: watch::Receiver<SendRate>,
    config: CipherLoopConfig,
) -> JoinHandle<()> {
    tokio::spawn(run(dcnet, sender, rate, config))
}

async fn run(
    dcnet: Arc<Mutex<DcNetEntity>>,
    sender: SharedSender,
    rate: watch::Receiver<SendRate>,
    config: CipherLoopConfig,
) {
    let mut rng = StdRng::from_entropy();
    let mut round = 0u32;
    debug!(trustee_id = config.trustee_id, "cipher loop started");

    loop {
        let current = *rate.borrow();
        match current {
            SendRate::Killed => break,
            SendRate::Halved if !config.never_slow_down => {
                tokio::time::sleep(config.base_sleep_time).await;
            }
            _ => {}
        }
        if *rate.borrow() == SendRate::Killed {
            break;
        }

        let sent = next_cipher(&dcnet, config.trustee_id, round, &mut rng)
            .and_then(|message| sender.send_to_relay(message));
        if let Err(err) = sent {
            error!(trustee_id = config.trustee_id, round, %err, "cipher loop stopped");
            break;
        }
        round += 1;
        tokio::time::sleep(config.base_sleep_time).await;
    }
    debug!(trustee_id = config.trustee_id, round, "cipher loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sender::MessageSender, transport::ChannelTransport};
    use prifi_crypto::KeyPair;
    use rand_chacha::ChaCha20Rng;

    #[tokio::test]
    async fn test_loop_sends_consecutive_rounds_until_killed() {
        let mut rng = ChaCha20Rng::seed_from_u64(111);
        let secret = KeyPair::generate(&mut rng).shared_secret(&KeyPair::generate(&mut rng).public());
        let dcnet = Arc::new(Mutex::new(DcNetEntity::new_trustee(8, &[secret], false)));

        let (transport, mut mailboxes) = ChannelTransport::new(1, 1);
        let (rate_tx, rate_rx) = watch::channel(SendRate::Active);
        let sender: SharedSender = transport.clone();
        let handle = spawn(
            dcnet,
            sender,
            rate_rx,
            CipherLoopConfig {
                trustee_id: 0,
                base_sleep_time: Duration::from_millis(1),
                never_slow_down: false,
            },
        );

        for expected in 0..3u32 {
            let message = mailboxes.relay.recv().await.unwrap().open().unwrap();
            match message {
                Message::TrusteeCipher {
                    round_id, trustee_id, ..
                } => {
                    assert_eq!(round_id, expected);
                    assert_eq!(trustee_id, 0);
                }
                other => panic!("unexpected {}", other.name()),
            }
        }

        rate_tx.send(SendRate::Killed).unwrap();
        handle.await.unwrap();
        let _ = transport.send_to_relay(Message::Shutdown);
    }
}
