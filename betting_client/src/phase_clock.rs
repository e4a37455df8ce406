//! Batch phase derivation
//!
//! A batch is a commit window of `commit_duration` starting at `start_time`,
//! followed by a reveal window of `reveal_duration`. Each boundary belongs
//! to the later phase: at exactly `start + commit_duration` the batch is
//! already revealing. Nothing here is cached; callers re-evaluate on every
//! timer tick.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Commit window length used by the hook unless configured otherwise
pub const DEFAULT_COMMIT_DURATION: Duration = Duration::from_secs(5 * 60);
/// Reveal window length used by the hook unless configured otherwise
pub const DEFAULT_REVEAL_DURATION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Commit,
    Reveal,
    Settled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Commit => "commit",
            Phase::Reveal => "reveal",
            Phase::Settled => "settled",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed window lengths shared by every batch of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSchedule {
    #[serde(with = "humantime_serde")]
    pub commit_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub reveal_duration: Duration,
}

impl Default for BatchSchedule {
    fn default() -> Self {
        Self {
            commit_duration: DEFAULT_COMMIT_DURATION,
            reveal_duration: DEFAULT_REVEAL_DURATION,
        }
    }
}

impl BatchSchedule {
    pub fn new(commit_duration: Duration, reveal_duration: Duration) -> Self {
        Self {
            commit_duration,
            reveal_duration,
        }
    }

    /// Window of a batch that started at `start_time`
    pub fn window(&self, start_time: Timestamp) -> BatchWindow {
        BatchWindow {
            start_time,
            schedule: *self,
        }
    }
}

/// One batch's time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    pub start_time: Timestamp,
    pub schedule: BatchSchedule,
}

impl BatchWindow {
    pub fn commit_ends_at(&self) -> Timestamp {
        self.start_time.add_duration(self.schedule.commit_duration)
    }

    pub fn reveal_ends_at(&self) -> Timestamp {
        self.commit_ends_at().add_duration(self.schedule.reveal_duration)
    }

    pub fn current_phase(&self, now: Timestamp) -> Phase {
        if now < self.commit_ends_at() {
            Phase::Commit
        } else if now < self.reveal_ends_at() {
            Phase::Reveal
        } else {
            Phase::Settled
        }
    }

    /// Time left in the current phase; zero once settled
    pub fn time_remaining(&self, now: Timestamp) -> Duration {
        match self.current_phase(now) {
            Phase::Commit => now.until(self.commit_ends_at()),
            Phase::Reveal => now.until(self.reveal_ends_at()),
            Phase::Settled => Duration::ZERO,
        }
    }
}

/// `m:ss` countdown as shown next to the phase badge
pub fn format_countdown(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}
