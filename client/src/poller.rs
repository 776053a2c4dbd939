use std::time::Duration;

use ringwire::collab::reliability::ExponentialBackoff;

/// Delay between full-state polls: the base interval while polls succeed,
/// doubling per consecutive failure up to `max`.
#[derive(Clone, Debug)]
pub struct PollSchedule {
    base: Duration,
    max: Duration,
    backoff: ExponentialBackoff,
    failures: u32,
}

impl PollSchedule {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            backoff: ExponentialBackoff::new(base.saturating_mul(2).min(max), max)
                .with_multiplier(2.0)
                .without_jitter(),
            failures: 0,
        }
    }

    pub fn on_success(&mut self) -> Duration {
        self.failures = 0;
        self.backoff.reset();
        self.base
    }

    pub fn on_failure(&mut self) -> Duration {
        self.failures += 1;
        self.backoff.next_delay().unwrap_or(self.max)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_and_recovers() {
        let mut poll = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(poll.on_success(), Duration::from_secs(1));

        let delays: Vec<_> = (0..5).map(|_| poll.on_failure()).collect();
        assert_eq!(delays, [2, 4, 8, 8, 8].map(Duration::from_secs).to_vec());
        assert_eq!(poll.failures(), 5);

        assert_eq!(poll.on_success(), Duration::from_secs(1));
        assert_eq!(poll.failures(), 0);
        assert_eq!(poll.on_failure(), Duration::from_secs(2));
    }

    #[test]
    fn max_below_base_is_raised() {
        let mut poll = PollSchedule::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(poll.on_failure(), Duration::from_secs(5));
    }
}
