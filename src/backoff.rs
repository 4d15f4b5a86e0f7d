//! Retry timing functions.
//!
//! A [`Backoff`] maps an attempt index to the pause taken before that
//! attempt runs. Attempt 0 always maps to zero delay, so the first attempt
//! of any operation starts immediately.

use crate::context::ContextKey;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A pure function from attempt index to delay.
#[derive(Clone)]
pub struct Backoff {
    label: &'static str,
    delay: Arc<dyn Fn(usize) -> Duration + Send + Sync>,
}

impl Backoff {
    /// Wraps an arbitrary delay function. The zero-delay convention for
    /// attempt 0 is enforced here, not by the function.
    pub fn new(label: &'static str, delay: impl Fn(usize) -> Duration + Send + Sync + 'static) -> Self {
        Backoff {
            label,
            delay: Arc::new(delay),
        }
    }

    /// The delay taken before the attempt with the given index.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            (self.delay)(attempt)
        }
    }

    /// No delay for any attempt.
    pub fn none() -> Self {
        Backoff::new("none", |_| Duration::ZERO)
    }

    /// The same `base` delay before every retry.
    pub fn constant(base: Duration) -> Self {
        Backoff::new("constant", move |_| base)
    }

    /// `base * 2^(n-1)` before retry `n`: base, 2·base, 4·base, ...
    pub fn exponential(base: Duration) -> Self {
        Backoff::new("exponential", move |attempt| {
            base.saturating_mul(1_u32.checked_shl(attempt as u32 - 1).unwrap_or(u32::MAX))
        })
    }

    /// `base * n` before retry `n`: base, 2·base, 3·base, ...
    pub fn linear(base: Duration) -> Self {
        Backoff::new("linear", move |attempt| {
            base.saturating_mul(attempt.min(u32::MAX as usize) as u32)
        })
    }

    /// `base * fib(n)` before retry `n`: base, base, 2·base, 3·base, ...
    pub fn fibonacci(base: Duration) -> Self {
        Backoff::new("fibonacci", move |attempt| {
            let (mut a, mut b) = (0_u64, 1_u64);
            for _ in 0..attempt {
                let next = a.saturating_add(b);
                a = b;
                b = next;
            }
            base.saturating_mul(a.min(u32::MAX as u64) as u32)
        })
    }

    /// Wraps `self` so each retry sleeps a uniform sample of
    /// `[0, self.delay(n)]`, spreading simultaneous retries apart.
    pub fn jittered(self, seed: u64) -> Self {
        let rng = Mutex::new(oorandom::Rand64::new(seed as u128));
        let base = self.delay.clone();
        Backoff::new("jittered", move |attempt| {
            let upper = base(attempt);
            let nanos = upper.as_nanos().min(u64::MAX as u128) as u64;
            if nanos == 0 {
                return Duration::ZERO;
            }
            Duration::from_nanos(rng.lock().rand_range(0..nanos.saturating_add(1)))
        })
    }

    /// The label this backoff renders as in diagnostics.
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Backoff({})", self.label)
    }
}

/// Context key for the [`Backoff`] driving the retry loop.
pub struct BackoffKey;

impl ContextKey for BackoffKey {
    type Value = Backoff;

    fn default_value() -> Backoff {
        Backoff::exponential(Duration::from_secs(1))
    }

    fn name() -> &'static str {
        "Backoff"
    }
}

/// Context key for the maximum number of retries after the first attempt.
pub struct MaxRetriesKey;

impl ContextKey for MaxRetriesKey {
    type Value = usize;

    fn default_value() -> usize {
        0
    }

    fn name() -> &'static str {
        "MaxRetries"
    }
}

/// Context key holding the current attempt index while the retry loop is
/// executing an operation body. `None` outside of a run.
pub struct RetryIndexKey;

impl ContextKey for RetryIndexKey {
    type Value = Option<usize>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "RetryIndex"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn delays(backoff: &Backoff, n: usize) -> Vec<Duration> {
        (0..n).map(|attempt| backoff.delay(attempt)).collect()
    }

    #[test]
    fn attempt_zero_is_always_immediate() {
        for backoff in [
            Backoff::none(),
            Backoff::constant(MS * 10),
            Backoff::exponential(MS * 10),
            Backoff::linear(MS * 10),
            Backoff::fibonacci(MS * 10),
        ] {
            assert_eq!(backoff.delay(0), Duration::ZERO, "{backoff:?}");
        }
    }

    #[test]
    fn exponential_doubles_per_retry() {
        let backoff = Backoff::exponential(MS * 10);
        assert_eq!(
            delays(&backoff, 5),
            vec![Duration::ZERO, MS * 10, MS * 20, MS * 40, MS * 80]
        );
    }

    #[test]
    fn linear_grows_by_base() {
        let backoff = Backoff::linear(MS * 10);
        assert_eq!(
            delays(&backoff, 4),
            vec![Duration::ZERO, MS * 10, MS * 20, MS * 30]
        );
    }

    #[test]
    fn fibonacci_follows_the_sequence() {
        let backoff = Backoff::fibonacci(MS * 10);
        assert_eq!(
            delays(&backoff, 6),
            vec![Duration::ZERO, MS * 10, MS * 10, MS * 20, MS * 30, MS * 50]
        );
    }

    #[test]
    fn jitter_stays_within_the_base_delay() {
        let backoff = Backoff::exponential(MS * 10).jittered(7);
        for attempt in 1..6 {
            let upper = Backoff::exponential(MS * 10).delay(attempt);
            for _ in 0..32 {
                assert!(backoff.delay(attempt) <= upper);
            }
        }
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }
}
