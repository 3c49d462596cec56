// Copyright (c) 2024 The PriFi Authors

//! Trustee rate limiting.
//!
//! Trustees produce ciphers faster than clients; the relay buffers them and
//! tells a trustee to slow down once its buffer reaches the high bound, and to
//! resume once it drained to the low bound.

use crate::error::{PrifiError, PrifiResult};
use std::fmt;

/// Called with the id of the trustee to stop or resume.
pub type RateCallback = Box<dyn Fn(u32) + Send + Sync>;

/// Watermark-based stop/resume notifications, one state per trustee.
pub struct RateLimiter {
    low_bound: usize,
    high_bound: usize,
    stop: RateCallback,
    resume: RateCallback,
    stop_sent: Vec<bool>,
    resume_sent: Vec<bool>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("low_bound", &self.low_bound)
            .field("high_bound", &self.high_bound)
            .field("stop_sent", &self.stop_sent)
            .field("resume_sent", &self.resume_sent)
            .finish()
    }
}

impl RateLimiter {
    /// A limiter for `n_trustees` trustees.
    pub fn new(
        n_trustees: usize,
        low_bound: usize,
        high_bound: usize,
        stop: RateCallback,
        resume: RateCallback,
    ) -> PrifiResult<Self> {
        if low_bound > high_bound {
            return Err(PrifiError::InvalidRateLimit(
                "low bound must not exceed the high bound",
            ));
        }
        Ok(Self {
            low_bound,
            high_bound,
            stop,
            resume,
            stop_sent: vec![false; n_trustees],
            resume_sent: vec![false; n_trustees],
        })
    }

    /// React to trustee `trustee_id` having `buffered` ciphers waiting.
    pub fn check(&mut self, trustee_id: u32, buffered: usize) {
        let idx = trustee_id as usize;
        if idx >= self.stop_sent.len() {
            return;
        }
        if buffered >= self.high_bound && !self.stop_sent[idx] {
            (self.stop)(trustee_id);
            self.stop_sent[idx] = true;
            self.resume_sent[idx] = false;
        } else if buffered <= self.low_bound && !self.resume_sent[idx] {
            (self.resume)(trustee_id);
            self.stop_sent[idx] = false;
            self.resume_sent[idx] = true;
        }
    }
}
