// Copyright (c) 2024 The PriFi Authors

//! The relay's round bookkeeping.
//!
//! Up to `W` rounds are open at once. Ciphers may arrive for any round that is
//! not in the past, including rounds that are not open yet (trustees run
//! ahead of clients); they are buffered per entity until their round becomes
//! the current one, i.e. the smallest open round.
//!
//! Every public method takes the lock once, so the relay's processing task and
//! its timers can share a manager.

pub mod rate_limit;

use crate::{
    error::{PrifiError, PrifiResult},
    messages::Message,
};
use parking_lot::Mutex;
use rate_limit::{RateCallback, RateLimiter};
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

#[derive(Debug)]
struct RoundState {
    open_rounds: BTreeMap<u32, Instant>,
    last_round_closed: Option<u32>,
    client_ciphers: Vec<BTreeMap<u32, Vec<u8>>>,
    trustee_ciphers: Vec<BTreeMap<u32, Vec<u8>>>,
    client_acks: Vec<bool>,
    trustee_acks: Vec<bool>,
    data_already_sent: BTreeMap<u32, Option<Message>>,
    schedule: Option<Vec<bool>>,
    last_owner: Option<u32>,
    next_open_closed_round: i64,
    rate_limiter: Option<RateLimiter>,
}

impl RoundState {
    fn current_round(&self) -> Option<u32> {
        self.open_rounds.keys().next().copied()
    }

    fn next_round_to_open(&self) -> u32 {
        let mut candidate = match self.current_round() {
            Some(current) => current + 1,
            None => self.last_round_closed.map_or(0, |r| r + 1),
        };
        while self.open_rounds.contains_key(&candidate) {
            candidate += 1;
        }
        candidate
    }

    fn has_all_ciphers(&self) -> bool {
        self.client_acks.iter().all(|&ack| ack) && self.trustee_acks.iter().all(|&ack| ack)
    }

    /// Acks for `round` from what is already buffered.
    fn rebuild_acks(&mut self, round: Option<u32>) {
        self.client_acks = match round {
            Some(r) => self.client_ciphers.iter().map(|b| b.contains_key(&r)).collect(),
            None => vec![false; self.client_ciphers.len()],
        };
        self.trustee_acks = match round {
            Some(r) => self.trustee_ciphers.iter().map(|b| b.contains_key(&r)).collect(),
            None => vec![false; self.trustee_ciphers.len()],
        };
    }

    fn check_rate(&mut self, trustee_id: u32) {
        let buffered = self
            .trustee_ciphers
            .get(trustee_id as usize)
            .map_or(0, BTreeMap::len);
        if let Some(limiter) = &mut self.rate_limiter {
            limiter.check(trustee_id, buffered);
        }
    }

    fn close_current(&mut self) -> PrifiResult<u32> {
        let round = self.current_round().ok_or(PrifiError::NoOpenRound)?;

        self.data_already_sent.remove(&round);
        self.open_rounds.remove(&round);
        for buffer in self
            .client_ciphers
            .iter_mut()
            .chain(self.trustee_ciphers.iter_mut())
        {
            buffer.remove(&round);
        }
        for trustee_id in 0..self.trustee_ciphers.len() as u32 {
            self.check_rate(trustee_id);
        }

        self.last_round_closed = Some(round);
        let next = self.current_round();
        self.rebuild_acks(next);
        Ok(round)
    }
}

/// Round bookkeeping shared by the relay's tasks.
#[derive(Debug)]
pub struct BufferedRoundManager {
    n_clients: usize,
    n_trustees: usize,
    max_open_rounds: usize,
    state: Mutex<RoundState>,
}

impl BufferedRoundManager {
    /// A manager for `n_clients` and `n_trustees` allowing `max_open_rounds`
    /// concurrent rounds.
    pub fn new(n_clients: usize, n_trustees: usize, max_open_rounds: usize) -> Self {
        Self {
            n_clients,
            n_trustees,
            max_open_rounds,
            state: Mutex::new(RoundState {
                open_rounds: BTreeMap::new(),
                last_round_closed: None,
                client_ciphers: vec![BTreeMap::new(); n_clients],
                trustee_ciphers: vec![BTreeMap::new(); n_trustees],
                client_acks: vec![false; n_clients],
                trustee_acks: vec![false; n_trustees],
                data_already_sent: BTreeMap::new(),
                schedule: None,
                last_owner: None,
                next_open_closed_round: 1,
                rate_limiter: None,
            }),
        }
    }

    /// Install stop/resume notifications driven by the trustee buffers.
    pub fn add_rate_limiter(
        &self,
        low_bound: usize,
        high_bound: usize,
        stop: RateCallback,
        resume: RateCallback,
    ) -> PrifiResult<()> {
        let limiter = RateLimiter::new(self.n_trustees, low_bound, high_bound, stop, resume)?;
        self.state.lock().rate_limiter = Some(limiter);
        Ok(())
    }

    /// Maximum number of concurrently open rounds.
    pub fn window_size(&self) -> usize {
        self.max_open_rounds
    }

    /// The smallest open round.
    pub fn current_round(&self) -> Option<u32> {
        self.state.lock().current_round()
    }

    /// Round [`BufferedRoundManager::open_next_round`] would open.
    pub fn next_round_to_open(&self) -> u32 {
        self.state.lock().next_round_to_open()
    }

    /// Number of open rounds.
    pub fn open_rounds(&self) -> usize {
        self.state.lock().open_rounds.len()
    }

    /// Whether `round` is open.
    pub fn is_round_open(&self, round: u32) -> bool {
        self.state.lock().open_rounds.contains_key(&round)
    }

    /// Open the next round and return its id.
    pub fn open_next_round(&self) -> PrifiResult<u32> {
        let mut state = self.state.lock();
        if state.open_rounds.len() >= self.max_open_rounds {
            return Err(PrifiError::WindowFull(state.open_rounds.len()));
        }

        let any_open = !state.open_rounds.is_empty();
        let round = state.next_round_to_open();
        state.data_already_sent.insert(round, None);
        state.open_rounds.insert(round, Instant::now());

        if !any_open {
            state.rebuild_acks(Some(round));
        }
        debug!(round, open = state.open_rounds.len(), "round opened");
        Ok(round)
    }

    fn check_entity(kind: &'static str, id: u32, count: usize) -> PrifiResult<usize> {
        let idx = id as usize;
        if idx >= count {
            return Err(PrifiError::UnknownEntity(kind, id));
        }
        Ok(idx)
    }

    /// Buffer a client cipher.
    pub fn add_client_cipher(&self, round: u32, client_id: u32, data: Vec<u8>) -> PrifiResult<()> {
        let idx = Self::check_entity("client", client_id, self.n_clients)?;
        let mut state = self.state.lock();
        let current = state.current_round().ok_or(PrifiError::NoOpenRound)?;
        if data.is_empty() {
            return Err(PrifiError::EmptyCipher(round));
        }
        if round < current {
            return Err(PrifiError::PastRound { round, current });
        }

        state.client_ciphers[idx].insert(round, data);
        if round == current {
            state.client_acks[idx] = true;
        }
        trace!(round, client_id, "client cipher buffered");
        Ok(())
    }

    /// Buffer a trustee cipher; accepted before any round is open.
    pub fn add_trustee_cipher(&self, round: u32, trustee_id: u32, data: Vec<u8>) -> PrifiResult<()> {
        let idx = Self::check_entity("trustee", trustee_id, self.n_trustees)?;
        let mut state = self.state.lock();
        let current = state.current_round();
        if data.is_empty() {
            return Err(PrifiError::EmptyCipher(round));
        }
        if let Some(current) = current {
            if round < current {
                return Err(PrifiError::PastRound { round, current });
            }
        }

        state.trustee_ciphers[idx].insert(round, data);
        if current == Some(round) {
            state.trustee_acks[idx] = true;
        }
        state.check_rate(trustee_id);
        trace!(round, trustee_id, "trustee cipher buffered");
        Ok(())
    }

    /// Whether every client and trustee sent its cipher for the current round.
    pub fn has_all_ciphers_for_current_round(&self) -> bool {
        self.state.lock().has_all_ciphers()
    }

    /// Take the ciphers of the current round, in entity order.
    pub fn collect_round_data(&self) -> PrifiResult<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let mut state = self.state.lock();
        let round = state.current_round().ok_or(PrifiError::NoOpenRound)?;
        if !state.has_all_ciphers() {
            return Err(PrifiError::IncompleteRound(round));
        }

        let clients = state
            .client_ciphers
            .iter_mut()
            .map(|buffer| buffer.remove(&round).unwrap_or_default())
            .collect();
        let trustees = state
            .trustee_ciphers
            .iter_mut()
            .map(|buffer| buffer.remove(&round).unwrap_or_default())
            .collect();
        Ok((clients, trustees))
    }

    /// Close the current round once it is complete.
    pub fn close_round(&self) -> PrifiResult<u32> {
        let mut state = self.state.lock();
        let round = state.current_round().ok_or(PrifiError::NoOpenRound)?;
        if !state.has_all_ciphers() {
            return Err(PrifiError::IncompleteRound(round));
        }
        let closed = state.close_current()?;
        debug!(round = closed, "round closed");
        Ok(closed)
    }

    /// Close the current round whatever arrived.
    pub fn force_close_round(&self) -> PrifiResult<u32> {
        let closed = self.state.lock().close_current()?;
        debug!(round = closed, "round force-closed");
        Ok(closed)
    }

    /// Clients and trustees whose cipher for the current round is missing.
    pub fn missing_ciphers_for_current_round(&self) -> (Vec<u32>, Vec<u32>) {
        let state = self.state.lock();
        let missing = |acks: &[bool]| -> Vec<u32> {
            acks.iter()
                .enumerate()
                .filter_map(|(id, ack)| (!ack).then_some(id as u32))
                .collect()
        };
        (missing(&state.client_acks), missing(&state.trustee_acks))
    }

    /// Time since `round` was opened.
    pub fn time_spent_in_round(&self, round: u32) -> Option<Duration> {
        self.state
            .lock()
            .open_rounds
            .get(&round)
            .map(|opened| opened.elapsed())
    }

    /// Remember the downstream message that opened `round`.
    pub fn set_data_already_sent(&self, round: u32, message: Message) -> PrifiResult<()> {
        let mut state = self.state.lock();
        if !state.open_rounds.contains_key(&round) {
            return Err(PrifiError::NotInitialized("downstream cache of a closed round"));
        }
        state.data_already_sent.insert(round, Some(message));
        Ok(())
    }

    /// The downstream message that opened `round`, if it is still open.
    pub fn data_already_sent(&self, round: u32) -> Option<Message> {
        self.state
            .lock()
            .data_already_sent
            .get(&round)
            .cloned()
            .flatten()
    }

    /// Store the schedule decoded from an open/closed round.
    pub fn set_stored_round_schedule(&self, schedule: Vec<bool>) {
        let mut state = self.state.lock();
        let open_slots = schedule.iter().filter(|&&open| open).count() as i64;
        let current = state.current_round().map_or(-1, i64::from);

        state.schedule = Some(schedule);
        state.last_owner = None;
        state.next_open_closed_round = current + open_slots + self.max_open_rounds as i64 + 1;
        debug!(
            open_slots,
            next_open_closed_round = state.next_open_closed_round,
            "slot schedule stored"
        );
    }

    /// Round that will carry the next open/closed request.
    pub fn next_open_closed_round(&self) -> i64 {
        self.state.lock().next_open_closed_round
    }

    /// Whether the next round to open must carry an open/closed request.
    pub fn is_next_downstream_round_for_open_closed_request(&self) -> bool {
        let state = self.state.lock();
        i64::from(state.next_round_to_open()) == state.next_open_closed_round
    }

    /// Advance to the next slot owner; `None` if the schedule closes every
    /// slot.
    pub fn update_and_get_next_owner_id(&self) -> Option<u32> {
        let mut state = self.state.lock();
        let n = self.n_clients as u32;
        let first = state.last_owner.map_or(0, |last| (last + 1) % n);

        let owner = match &state.schedule {
            Some(schedule) if !schedule.is_empty() => (0..n)
                .map(|step| (first + step) % n)
                .find(|&slot| schedule.get(slot as usize).copied().unwrap_or(true))?,
            _ => first,
        };
        state.last_owner = Some(owner);
        Some(owner)
    }

    /// Number of ciphers buffered for `trustee_id`.
    pub fn number_of_buffered_ciphers(&self, trustee_id: u32) -> usize {
        self.state
            .lock()
            .trustee_ciphers
            .get(trustee_id as usize)
            .map_or(0, BTreeMap::len)
    }
}
