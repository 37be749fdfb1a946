//! Retry backoff strategy used by the connection state machine.

use rand::Rng;
use std::time::Duration;

pub trait Backoff: Send + Sync {
    /// Delay before retry attempt `n` (0-based: the first retry is `n=0`).
    fn get_backoff(&self, n: u32) -> Duration;
}

/// `delay = uniform(0, min(max, base * 2^n))`: full jitter rather than
/// equal/decorrelated jitter, so a thundering herd of devices
/// reconnecting after an outage doesn't resynchronize on the
/// exponential curve itself.
pub struct FullJitterBackoff {
    base: Duration,
    max: Duration,
}

impl FullJitterBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Backoff for FullJitterBackoff {
    fn get_backoff(&self, n: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << n.min(32));
        let capped = exp.min(self.max.as_millis());
        if capped == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0..=capped);
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_the_cap() {
        let b = FullJitterBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        for n in 0..10 {
            let d = b.get_backoff(n);
            assert!(d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn backoff_grows_exponentially_before_hitting_the_cap() {
        let b = FullJitterBackoff::new(Duration::from_millis(10), Duration::from_secs(3600));
        // With a huge cap, get_backoff(n) is bounded by base * 2^n; sample
        // many times and check the observed max roughly tracks the bound.
        let bound_at_3 = 10u128 * 8; // base * 2^3
        let max_seen = (0..200).map(|_| b.get_backoff(3).as_millis()).max().unwrap();
        assert!(max_seen <= bound_at_3);
    }
}
