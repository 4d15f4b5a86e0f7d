//! Clock and sleep abstractions.
//!
//! Every timestamp written into operation state goes through a [`Clock`]
//! read from the context, and every retry/backoff pause goes through a
//! [`Delayer`], so tests can substitute deterministic implementations.

use crate::context::ContextKey;
use crate::BoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of the current instant.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// An asynchronous sleep.
///
/// The returned future must respect cancellation: dropping it abandons the
/// wait without side effects.
pub trait Delayer: Send + Sync + fmt::Debug + 'static {
    /// Completes after roughly `duration` has elapsed.
    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// A [`Delayer`] backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioDelayer;

impl Delayer for TokioDelayer {
    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Context key for the [`Clock`] used to stamp state updates.
pub struct ClockKey;

impl ContextKey for ClockKey {
    type Value = Arc<dyn Clock>;

    fn default_value() -> Self::Value {
        Arc::new(SystemClock)
    }

    fn name() -> &'static str {
        "Clock"
    }
}

/// Context key for the [`Delayer`] used by retry backoff and delays.
pub struct DelayerKey;

impl ContextKey for DelayerKey {
    type Value = Arc<dyn Delayer>;

    fn default_value() -> Self::Value {
        Arc::new(TokioDelayer)
    }

    fn name() -> &'static str {
        "Delayer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn default_keys_resolve() {
        let context = Context::new();
        let clock = context.get::<ClockKey>();
        let before = Instant::now();
        assert!(clock.now() >= before);
        let _delayer = context.get::<DelayerKey>();
    }
}
