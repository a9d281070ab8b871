use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<i64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// Milliseconds since the Unix epoch. Used both as `last_edit_epoch` and as
/// the sync watermark.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(i64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-node clock that hands out strictly increasing epochs, even when the
/// wall clock stalls or steps backwards.
pub struct EditClock {
    last_ms: i64,
}

impl EditClock {
    pub fn new() -> Self {
        Self { last_ms: 0 }
    }

    /// Generate the next strictly increasing epoch.
    pub fn tick(&mut self) -> Result<Epoch, CoreError> {
        let now = physical_now()?;
        self.last_ms = if now > self.last_ms { now } else { self.last_ms + 1 };
        Ok(Epoch(self.last_ms))
    }

    /// Fold in an epoch stamped elsewhere so later local stamps sort after it.
    pub fn observe(&mut self, seen: Epoch) {
        if seen.0 > self.last_ms {
            self.last_ms = seen.0;
        }
    }

    pub fn last(&self) -> Epoch {
        Epoch(self.last_ms)
    }
}

impl Default for EditClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_monotonicity() {
        let mut clock = EditClock::new();
        let mut prev = clock.tick().unwrap();
        for _ in 0..100 {
            let next = clock.tick().unwrap();
            assert!(next > prev, "expected {next:?} > {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn stalled_wall_clock_still_advances() {
        let mut clock = EditClock::new();
        let future_ms = physical_now().unwrap() + 100_000;
        clock.last_ms = future_ms;

        assert_eq!(clock.tick().unwrap().millis(), future_ms + 1);
        assert_eq!(clock.tick().unwrap().millis(), future_ms + 2);
    }

    #[test]
    fn observe_moves_clock_past_remote() {
        let mut clock = EditClock::new();
        let local = clock.tick().unwrap();
        let remote = Epoch::from_millis(local.millis() + 50_000);

        clock.observe(remote);
        let next = clock.tick().unwrap();
        assert!(next > remote, "{next:?} should be > {remote:?}");

        // An older epoch never pulls the clock back.
        clock.observe(Epoch::from_millis(1));
        assert!(clock.tick().unwrap() > next);
    }
}
