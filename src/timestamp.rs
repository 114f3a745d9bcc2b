use std::fmt;
use std::ops;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// A microsecond-resolution wall-clock timestamp.
///
/// Captured once per loop iteration when `epoll_wait` returns and handed to
/// every read/message callback fired from that iteration, so a batch of
/// events shares a single receive time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp {
            micros: since_epoch.as_micros() as i64,
        }
    }

    /// An invalid (zero) timestamp, ordered before every valid one.
    pub fn invalid() -> Timestamp {
        Timestamp { micros: 0 }
    }

    /// Returns true unless this is the [`invalid`] timestamp.
    ///
    /// [`invalid`]: Timestamp::invalid
    pub fn is_valid(self) -> bool {
        self.micros > 0
    }

    /// Microseconds since the Unix epoch.
    pub fn micros_since_epoch(self) -> i64 {
        self.micros
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        if self.micros <= earlier.micros {
            Duration::ZERO
        } else {
            Duration::from_micros((self.micros - earlier.micros) as u64)
        }
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "{}.{:06}",
            self.micros / MICROS_PER_SECOND,
            self.micros % MICROS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Timestamp;
    use std::time::Duration;

    #[test]
    fn ordering_and_arithmetic() {
        let base = Timestamp::now();
        let later = base + Duration::from_millis(250);
        assert!(later > base);
        assert_eq!(later.duration_since(base), Duration::from_millis(250));
        assert_eq!(base.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn invalid_sorts_first() {
        assert!(!Timestamp::invalid().is_valid());
        assert!(Timestamp::invalid() < Timestamp::now());
    }
}
