//! Exponential backoff schedule for reconnect retries
//!
//! The pause grows by a constant factor after each failed attempt, with an
//! optional cap. Growth saturates instead of overflowing.

use std::time::Duration;

/// Sequence of pauses between consecutive retries.
///
/// Yields `initial`, `initial * m`, `initial * m^2`, ... forever; callers
/// bound it with the retry limit.
///
/// # Example
///
/// ```
/// use mongo_proxy::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(Duration::from_millis(100), 2.0);
///
/// assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Pause that the next call to `next` returns
    current: Duration,
    /// Pause the schedule restarts from
    initial: Duration,
    /// Growth factor applied after each step
    multiplier: f64,
    /// Upper bound on any single pause
    max: Option<Duration>,
}

impl Backoff {
    /// Create a schedule starting at `initial` and growing by `multiplier`.
    pub fn new(initial: Duration, multiplier: f64) -> Self {
        Self {
            current: initial,
            initial,
            multiplier,
            max: None,
        }
    }

    /// Cap every pause at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self.current = self.current.min(max);
        self
    }

    /// Pause that would be returned next, without advancing.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Restart the schedule from the initial pause.
    pub fn reset(&mut self) {
        self.current = match self.max {
            Some(max) => self.initial.min(max),
            None => self.initial,
        };
    }

    fn grow(&self, delay: Duration) -> Duration {
        let nanos = (delay.as_nanos() as f64 * self.multiplier).round();
        let next = if nanos >= u64::MAX as f64 {
            Duration::MAX
        } else {
            Duration::from_nanos(nanos as u64)
        };
        match self.max {
            Some(max) => next.min(max),
            None => next,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current = self.grow(delay);
        Some(delay)
    }
}
