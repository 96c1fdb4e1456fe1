//! Production implementation of EmulationContext using Tokio.

use crate::EmulationContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Production context backed by the Tokio timer and the monotonic clock.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Seed for random decisions (damage selection)
    seed: u64,
}

impl TokioContext {
    /// Creates a new TokioContext with seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Creates a new TokioContext with an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            start: Instant::now(),
            seed,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::with_seed(seed))
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmulationContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_tokio_context_zero_sleep_returns() {
        let ctx = TokioContext::new();
        ctx.sleep(Duration::ZERO).await;
    }

    #[test]
    fn test_tokio_context_seed() {
        assert_eq!(TokioContext::new().seed(), 0);
        assert_eq!(TokioContext::with_seed(12345).seed(), 12345);
    }
}
