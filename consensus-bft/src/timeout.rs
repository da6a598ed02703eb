//! Round timeout tracking.
//!
//! Only the current round has a deadline. Its length grows linearly with the
//! number of consecutive rounds that timed out, so a committee with several
//! offline leaders still gives the next honest one enough time, and resets
//! as soon as a round makes progress.

use {
    crate::{config::BftConfig, types::Round},
    std::time::{Duration, Instant},
};

#[derive(Debug)]
pub struct TimeoutScheduler {
    config: BftConfig,
    started_at: Option<Instant>,
    /// Round the active deadline belongs to.
    round: Option<Round>,
    consecutive_timeouts: u32,
}

impl TimeoutScheduler {
    pub fn new(config: BftConfig) -> Self {
        Self {
            config,
            started_at: None,
            round: None,
            consecutive_timeouts: 0,
        }
    }

    /// Arm the deadline for `round`, replacing any earlier one.
    pub fn start(&mut self, round: Round) {
        self.started_at = Some(Instant::now());
        self.round = Some(round);
    }

    pub fn cancel(&mut self) {
        self.started_at = None;
        self.round = None;
    }

    /// Duration of the current deadline given the backoff state.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.config.round_timeout_ms(self.consecutive_timeouts))
    }

    /// Returns the round whose deadline has passed, if any.
    pub fn check_expired(&self) -> Option<Round> {
        let started_at = self.started_at?;
        let round = self.round?;
        (started_at.elapsed() >= self.timeout_duration()).then_some(round)
    }

    /// Time left before the deadline; `Duration::ZERO` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let started_at = self.started_at?;
        Some(self.timeout_duration().saturating_sub(started_at.elapsed()))
    }

    pub fn active_round(&self) -> Option<Round> {
        self.round
    }

    /// A round ended without a certificate: lengthen the next deadline.
    pub fn record_timeout(&mut self) {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
    }

    /// A round produced a certificate: back to the base deadline.
    pub fn record_progress(&mut self) {
        self.consecutive_timeouts = 0;
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }
}
