//! CoAP transmission parameters (RFC 7252 Section 4.8).

use std::time::Duration;

use rand::Rng;

/// Maximum time a datagram is expected to take from start to finish.
pub const MAX_LATENCY: Duration = Duration::from_secs(100);

/// Retransmission parameters of one mock server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionParams {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl TransmissionParams {
    #[must_use]
    pub fn new(ack_timeout: Duration, ack_random_factor: f64, max_retransmit: u32) -> Self {
        Self {
            ack_timeout,
            ack_random_factor: ack_random_factor.max(1.0),
            max_retransmit,
        }
    }

    /// Timeout before the first retransmission, drawn uniformly from
    /// `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`.
    #[must_use]
    pub fn initial_timeout(&self) -> Duration {
        if self.ack_random_factor <= 1.0 {
            return self.ack_timeout;
        }
        let factor = rand::thread_rng().gen_range(1.0..=self.ack_random_factor);
        self.ack_timeout.mul_f64(factor)
    }

    /// Upper bound of [`Self::initial_timeout`].
    #[must_use]
    pub fn max_initial_timeout(&self) -> Duration {
        self.ack_timeout.mul_f64(self.ack_random_factor)
    }

    /// Time from the first transmission to the last retransmission.
    #[must_use]
    pub fn max_transmit_span(&self) -> Duration {
        self.max_initial_timeout() * ((1u32 << self.max_retransmit) - 1)
    }

    /// Time from the first transmission until the sender gives up waiting
    /// for an acknowledgement.
    #[must_use]
    pub fn max_transmit_wait(&self) -> Duration {
        self.max_initial_timeout() * ((1u32 << (self.max_retransmit + 1)) - 1)
    }

    /// `ACK_TIMEOUT * 2^MAX_RETRANSMIT * ACK_RANDOM_FACTOR + 2 * MAX_LATENCY`.
    #[must_use]
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_initial_timeout() * (1u32 << self.max_retransmit) + MAX_LATENCY * 2
    }

    /// Nominal send times of every transmission, relative to the first one,
    /// assuming the minimal initial timeout. Used to check client backoff.
    #[must_use]
    pub fn retransmission_offsets(&self) -> Vec<Duration> {
        let mut offsets = Vec::with_capacity(self.max_retransmit as usize + 1);
        let mut at = Duration::ZERO;
        let mut timeout = self.ack_timeout;
        offsets.push(at);
        for _ in 0..self.max_retransmit {
            at += timeout;
            offsets.push(at);
            timeout *= 2;
        }
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_exchange_lifetime() {
        let params = TransmissionParams::default();
        assert_eq!(params.exchange_lifetime(), Duration::from_secs(248));
        assert_eq!(params.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(93));
    }

    #[test]
    fn test_initial_timeout_range() {
        let params = TransmissionParams::default();
        for _ in 0..100 {
            let t = params.initial_timeout();
            assert!(t >= Duration::from_secs(2) && t <= Duration::from_secs(3), "{t:?}");
        }
        let exact = TransmissionParams::new(Duration::from_secs(1), 1.0, 0);
        assert_eq!(exact.initial_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_retransmission_offsets() {
        const TEST_CASES: &[(u64, u32, &[u64])] = &[
            (1, 0, &[0]),
            (1, 2, &[0, 1, 3]),
            (2, 2, &[0, 2, 6]),
            (2, 4, &[0, 2, 6, 14, 30]),
        ];
        for &(ack_timeout, max_retransmit, expected) in TEST_CASES {
            let params = TransmissionParams::new(Duration::from_secs(ack_timeout), 1.0, max_retransmit);
            let secs: Vec<u64> = params
                .retransmission_offsets()
                .iter()
                .map(Duration::as_secs)
                .collect();
            assert_eq!(secs, expected);
        }
    }
}
