use std::time::Duration;

/// Timing and retry policy for a [`Client`](crate::Client).
///
/// Construct with [`Default::default`] and adjust with the `with_*` methods.
/// The defaults match the behavior libbitcoin servers are deployed for:
/// 10 second request and heartbeat windows, at most one rotation every 30
/// seconds, a renewal sweep every minute and a 24 hour subscription lifetime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a request waits for its response before failing over.
    pub(crate) request_timeout: Duration,

    /// Heartbeat silence tolerated before the active server is considered dead.
    pub(crate) heartbeat_timeout: Duration,

    /// Minimum time between two server rotations.
    pub(crate) min_rotation_interval: Duration,

    /// Period of the subscription renewal sweep.
    pub(crate) renew_interval: Duration,

    /// Lifetime granted to a subscription on subscribe or renew.
    pub(crate) subscription_ttl: Duration,

    /// Total send attempts per request, including the first one.
    pub(crate) max_attempts: u32,

    /// Delay before the first resend; doubles on each further attempt.
    pub(crate) backoff_base: Duration,

    /// Upper bound on the resend delay.
    pub(crate) backoff_cap: Duration,

    /// Capacity of the channel between a socket's receive pump and its reader.
    pub(crate) inbound_capacity: usize,

    /// Start from a random server of the pool instead of the first one.
    pub(crate) randomize_start: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            min_rotation_interval: Duration::from_secs(30),
            renew_interval: Duration::from_secs(60),
            subscription_ttl: Duration::from_secs(24 * 60 * 60),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            inbound_capacity: 1024,
            randomize_start: true,
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_min_rotation_interval(mut self, interval: Duration) -> Self {
        self.min_rotation_interval = interval;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    pub fn with_subscription_ttl(mut self, ttl: Duration) -> Self {
        self.subscription_ttl = ttl;
        self
    }

    /// Values below 1 are clamped to 1 (send once, never retry).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap.max(base);
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    pub fn with_randomized_start(mut self, randomize: bool) -> Self {
        self.randomize_start = randomize;
        self
    }

    /// Delay before resending after the `attempt`-th timeout (1-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let config = ClientConfig::default()
            .with_backoff(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(3));
        assert_eq!(config.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn max_attempts_never_drops_below_one() {
        let config = ClientConfig::default().with_max_attempts(0);
        assert_eq!(config.max_attempts, 1);
    }
}
