use std::time::Duration;

use rand::Rng;

/// Exponential backoff: the n-th retry sleeps `initial * factor^(n-1)`, capped at `max_delay`,
/// optionally randomized by `jitter` and bounded by `max_retries`.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<_> = Exponential::from_millis(100)
///     .factor(2.0)
///     .max_delay(Duration::from_millis(300))
///     .max_retries(4)
///     .collect();
/// assert_eq!(delays.len(), 4);
/// assert_eq!(delays[3], Duration::from_millis(300));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    initial: Duration,
    max_delay: Duration,
    factor: f64,
    /// between 0.0 (none) and 1.0
    jitter: f64,
    max_retries: Option<usize>,
    retries: usize,
}

impl Exponential {
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.0,
            max_retries: None,
            retries: 0,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Number of delays handed out so far.
    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }

    fn delay_for(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let delay_ms = if self.jitter == 0.0 {
            base_ms
        } else {
            base_ms * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };
        // f64 -> u64 saturates, so an overflowing power still ends at max_delay
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max) = self.max_retries
            && self.retries >= max
        {
            return None;
        }
        self.retries += 1;
        Some(self.delay_for(self.retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_factor() {
        let mut backoff = Exponential::from_millis(100).factor(2.0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.retries(), 3);
    }

    #[test]
    fn capped_at_max_delay() {
        let mut backoff = Exponential::from_millis(100).max_delay(Duration::from_millis(250));
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn stops_after_max_retries() {
        let mut backoff = Exponential::from_millis(1).max_retries(2);
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);

        backoff.reset();
        assert_eq!(backoff.next(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn zero_retries_yields_nothing() {
        assert_eq!(Exponential::from_millis(1).max_retries(0).next(), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut backoff = Exponential::from_millis(100).jitter(0.5);
        let delay = backoff.next().unwrap();
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn huge_exponent_does_not_overflow() {
        let mut backoff = Exponential::from_millis(1000)
            .factor(10.0)
            .max_delay(Duration::from_secs(5));
        let last = backoff.by_ref().take(400).last();
        assert_eq!(last, Some(Duration::from_secs(5)));
    }
}
