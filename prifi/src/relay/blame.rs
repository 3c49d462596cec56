// Copyright (c) 2024 The PriFi Authors

//! Disruption blame.
//!
//! A client whose slot was disrupted names the round and a flipped bit. Every
//! client then reveals its pad bit with each trustee and every trustee its
//! bit with each client. Both ends of a pair derive the bit from the same
//! shared secret, so a disagreeing pair contains a liar; both ends then
//! reveal the shared secret with a proof, and the relay recomputes the bit.

use super::{Relay, RelayState};
use crate::{
    dcnet::disruption,
    error::{PrifiError, PrifiResult},
    messages::Message,
};
use displaydoc::Display;
use prifi_crypto::RistrettoPoint;
use tracing::{info, warn};

/// Outcome of a blame.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum BlameVerdict {
    /// client {0}
    Client(u32),
    /// trustee {0}
    Trustee(u32),
    /// unfounded
    Unfounded,
}

/// A secret revealed by a suspect, with the result of its proof check.
#[derive(Debug)]
struct RevealedSecret {
    secret: RistrettoPoint,
    proven: bool,
}

#[derive(Debug)]
pub(super) struct BlameState {
    round: u32,
    bit_pos: u32,
    client_bits: Vec<Option<Vec<u8>>>,
    trustee_bits: Vec<Option<Vec<u8>>>,
    suspects: Option<(u32, u32)>,
    client_secret: Option<RevealedSecret>,
    trustee_secret: Option<RevealedSecret>,
}

fn record_bits(
    slots: &mut [Option<Vec<u8>>],
    kind: &'static str,
    id: u32,
    bits: Vec<u8>,
    expected: usize,
) -> PrifiResult<()> {
    if bits.len() != expected {
        return Err(PrifiError::Blame(format!(
            "{kind} {id} revealed {} bits, expected {expected}",
            bits.len()
        )));
    }
    let slot = slots
        .get_mut(id as usize)
        .ok_or(PrifiError::UnknownEntity(kind, id))?;
    if slot.is_some() {
        return Err(PrifiError::DuplicateEntity(kind, id));
    }
    *slot = Some(bits);
    Ok(())
}

impl Relay {
    pub(super) fn received_blame(&mut self, client_id: u32, round: u32, bit_pos: u32) -> PrifiResult<()> {
        let session = self.session_mut()?;
        if !session.config.disruption_protection {
            return Err(PrifiError::Blame("disruption protection is disabled".into()));
        }
        if client_id as usize >= session.config.n_clients {
            return Err(PrifiError::UnknownEntity("client", client_id));
        }
        let payload_bits = session.config.payload_size * 8;
        if bit_pos as usize >= payload_bits {
            return Err(PrifiError::Blame(format!(
                "bit {bit_pos} is outside of a {payload_bits}-bit payload"
            )));
        }

        let (n_clients, n_trustees) = (session.config.n_clients, session.config.n_trustees);
        session.blame = Some(BlameState {
            round,
            bit_pos,
            client_bits: vec![None; n_clients],
            trustee_bits: vec![None; n_trustees],
            suspects: None,
            client_secret: None,
            trustee_secret: None,
        });
        warn!(client_id, round, bit_pos, "disruption blame started");
        self.state = RelayState::Blaming;

        let request = Message::DisruptionRevealRequest {
            round_id: round,
            bit_pos,
        };
        for trustee_id in 0..n_trustees as u32 {
            self.sender.send_to_trustee(trustee_id, request.clone())?;
        }
        for client_id in 0..n_clients as u32 {
            self.sender.send_to_client(client_id, request.clone())?;
        }
        Ok(())
    }

    fn blame_mut(&mut self) -> PrifiResult<&mut BlameState> {
        self.session_mut()?
            .blame
            .as_mut()
            .ok_or(PrifiError::Blame("no blame in progress".into()))
    }

    pub(super) fn received_client_reveal(&mut self, client_id: u32, bits: Vec<u8>) -> PrifiResult<()> {
        let n_trustees = self.session_mut()?.config.n_trustees;
        let blame = self.blame_mut()?;
        record_bits(&mut blame.client_bits, "client", client_id, bits, n_trustees)?;
        self.check_reveals()
    }

    pub(super) fn received_trustee_reveal(&mut self, trustee_id: u32, bits: Vec<u8>) -> PrifiResult<()> {
        let n_clients = self.session_mut()?.config.n_clients;
        let blame = self.blame_mut()?;
        record_bits(&mut blame.trustee_bits, "trustee", trustee_id, bits, n_clients)?;
        self.check_reveals()
    }

    fn check_reveals(&mut self) -> PrifiResult<()> {
        let blame = self.blame_mut()?;
        if blame.suspects.is_some() {
            return Ok(());
        }
        let client_bits: Option<Vec<_>> = blame.client_bits.iter().cloned().collect();
        let trustee_bits: Option<Vec<_>> = blame.trustee_bits.iter().cloned().collect();
        let (Some(client_bits), Some(trustee_bits)) = (client_bits, trustee_bits) else {
            return Ok(());
        };

        let Some((client_id, trustee_id)) = disruption::find_mismatch(&client_bits, &trustee_bits)
        else {
            info!(round = blame.round, "every revealed bit agrees");
            return self.conclude_blame(BlameVerdict::Unfounded);
        };
        blame.suspects = Some((client_id, trustee_id));
        warn!(
            round = blame.round,
            client_id, trustee_id, "revealed bits disagree, asking for the shared secret"
        );
        self.sender.send_to_client(
            client_id,
            Message::DisruptionSecretRequest {
                peer_id: trustee_id,
            },
        )?;
        self.sender.send_to_trustee(
            trustee_id,
            Message::DisruptionSecretRequest { peer_id: client_id },
        )
    }

    fn suspects(&mut self, client_id: u32, trustee_id: u32) -> PrifiResult<()> {
        match self.blame_mut()?.suspects {
            Some(suspects) if suspects == (client_id, trustee_id) => Ok(()),
            suspects => Err(PrifiError::Blame(format!(
                "secret of client {client_id} and trustee {trustee_id}, suspects are {suspects:?}"
            ))),
        }
    }

    pub(super) fn received_client_secret(
        &mut self,
        client_id: u32,
        trustee_id: u32,
        secret: RistrettoPoint,
        proof: Vec<u8>,
    ) -> PrifiResult<()> {
        self.suspects(client_id, trustee_id)?;
        let session = self.session_mut()?;
        let client_pk = session.client_keys(client_id)?.pk;
        let trustee_pk = session.trustee_pk(trustee_id)?;
        let proven = disruption::verify_shared_secret(&client_pk, &trustee_pk, &secret, &proof).is_ok();
        self.blame_mut()?.client_secret = Some(RevealedSecret { secret, proven });
        self.check_secrets()
    }

    pub(super) fn received_trustee_secret(
        &mut self,
        trustee_id: u32,
        client_id: u32,
        secret: RistrettoPoint,
        proof: Vec<u8>,
    ) -> PrifiResult<()> {
        self.suspects(client_id, trustee_id)?;
        let session = self.session_mut()?;
        let client_pk = session.client_keys(client_id)?.pk;
        let trustee_pk = session.trustee_pk(trustee_id)?;
        let proven = disruption::verify_shared_secret(&trustee_pk, &client_pk, &secret, &proof).is_ok();
        self.blame_mut()?.trustee_secret = Some(RevealedSecret { secret, proven });
        self.check_secrets()
    }

    fn check_secrets(&mut self) -> PrifiResult<()> {
        let payload_size = self.session_mut()?.config.payload_size;
        let blame = self.blame_mut()?;
        let (Some((client_id, trustee_id)), Some(client), Some(trustee)) = (
            blame.suspects,
            blame.client_secret.as_ref(),
            blame.trustee_secret.as_ref(),
        ) else {
            return Ok(());
        };

        let verdict = if !client.proven {
            BlameVerdict::Client(client_id)
        } else if !trustee.proven {
            BlameVerdict::Trustee(trustee_id)
        } else {
            let bit = disruption::pad_bit(&client.secret, blame.round, payload_size, blame.bit_pos);
            let client_said = blame.client_bits[client_id as usize]
                .as_ref()
                .and_then(|bits| bits.get(trustee_id as usize).copied());
            if client_said != Some(bit) {
                BlameVerdict::Client(client_id)
            } else {
                BlameVerdict::Trustee(trustee_id)
            }
        };
        self.conclude_blame(verdict)
    }

    fn conclude_blame(&mut self, verdict: BlameVerdict) -> PrifiResult<()> {
        let round = self
            .session_mut()?
            .blame
            .take()
            .map(|blame| blame.round)
            .ok_or(PrifiError::Blame("no blame in progress".into()))?;
        warn!(round, %verdict, "blame concluded");
        self.results.push(format!("blame-round-{round}: {verdict}"));
        self.last_blame = Some(verdict);
        self.state = RelayState::Communicating;
        self.process_rounds(false)
    }
}
