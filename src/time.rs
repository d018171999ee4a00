use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Absolute point in time bounding a wait.
///
/// Every blocking operation of the harness takes a `Deadline` rather than a
/// relative timeout so that loops which receive several datagrams do not
/// extend the total wait.
///
/// ```
/// use std::time::Duration;
/// use lwm2m_harness::time::Deadline;
/// let deadline = Deadline::after(Duration::from_secs(5));
/// assert!(!deadline.is_expired());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    #[must_use]
    pub fn after_secs_f64(secs: f64) -> Self {
        Self::after(Duration::from_secs_f64(secs.max(0.0)))
    }

    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    #[must_use]
    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left until the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// The earlier of two deadlines.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        std::cmp::min(self, other)
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in {:.3}s", self.remaining().as_secs_f64())
    }
}

/// Splits a wall-clock time into the `(seconds, microseconds)` pair used by
/// PCAP record headers.
#[must_use]
pub fn pcap_timestamp(date: DateTime<Utc>) -> (u32, u32) {
    (date.timestamp() as u32, date.timestamp_subsec_micros())
}

/// Timestamp prefix for harness notes written into client logs.
#[must_use]
pub fn log_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcap_timestamp_test() {
        const TEST_CASES: &[(i64, u32)] = &[(1_525_987, 0), (0, 0), (2_584_229, 151_000_000)];

        for &(secs, nanos) in TEST_CASES {
            let sample = DateTime::<Utc>::from_timestamp(secs, nanos).expect("Invalid timestamp");
            let (ts_sec, ts_usec) = pcap_timestamp(sample);
            assert_eq!(i64::from(ts_sec), secs, "Mismatch in seconds field");
            assert_eq!(ts_usec, nanos / 1000, "Mismatch in microseconds field");
        }
    }

    #[tokio::test]
    async fn deadline_expiry() {
        let past = Deadline::after(Duration::ZERO);
        assert!(past.is_expired());
        assert_eq!(past.remaining(), Duration::ZERO);

        let future = Deadline::after(Duration::from_secs(60));
        assert!(!future.is_expired());
        assert!(future.remaining() > Duration::from_secs(59));
        assert_eq!(future.min(past), past);
    }

    #[test]
    fn log_timestamp_format() {
        let stamp = log_timestamp();
        assert_eq!(stamp.len(), "2024-01-01 00:00:00.000".len());
    }
}
