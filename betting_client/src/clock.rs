//! Wall-clock abstraction
//!
//! Phase derivation is a pure function of time, so the session reads "now"
//! through a [`Clock`] that tests can drive by hand.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unix timestamp in whole seconds, the resolution the hook contract uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create from Unix timestamp (seconds since epoch)
    pub fn from_unix(secs: i64) -> Self {
        Self(secs)
    }

    /// Create from milliseconds since epoch
    pub fn from_millis(millis: i64) -> Self {
        Self(millis.div_euclid(1000))
    }

    pub fn as_unix(&self) -> i64 {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        self.0 * 1000
    }

    /// Convert to chrono DateTime
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    /// Saturates at the largest representable timestamp
    pub fn add_duration(&self, duration: Duration) -> Self {
        let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(secs))
    }

    /// Time left until `later`, zero if `later` is not in the future
    pub fn until(&self, later: Timestamp) -> Duration {
        if later.0 > self.0 {
            Duration::from_secs(later.0.abs_diff(self.0))
        } else {
            Duration::ZERO
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Timestamp(secs)
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start.as_unix()),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.now.store(at.as_unix(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(Timestamp(now).add_duration(by).as_unix())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }
}
