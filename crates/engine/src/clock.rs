//! Tick-relative wall clock.

use chrono::{DateTime, Duration, Utc};

/// Wall clock shifted by a fixed offset, so a tick started "at" some instant
/// keeps advancing from there while sends are in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickClock {
    skew: Duration,
}

impl TickClock {
    /// The unshifted wall clock.
    pub fn system() -> Self {
        Self {
            skew: Duration::zero(),
        }
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            skew: now - Utc::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.skew
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shifted_clock_keeps_advancing() {
        let start = Utc::now() + Duration::hours(3);
        let clock = TickClock::starting_at(start);

        let first = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = clock.now();

        assert!(first >= start);
        assert!(first - start < Duration::seconds(1));
        assert!(second > first);
    }
}
