//! Virtual clock implementing EmulationContext for deterministic runs.

use async_trait::async_trait;
use skymesh_env::EmulationContext;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Simulation context backed by a manually advanced clock.
///
/// Sleeping advances virtual time instead of waiting, so a whole run of
/// paced steps completes instantly while `now()` reports what the wall clock
/// would have shown. Fakes standing in for slow machines call
/// [`VirtualContext::advance_time`] to model processing cost.
pub struct VirtualContext {
    /// Master seed for this run
    seed: u64,

    /// Current virtual time (nanoseconds since run start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Every sleep requested, in order
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl VirtualContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self
            .virtual_time_ns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    /// Sleeps requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Clone for VirtualContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            sleeps: Arc::clone(&self.sleeps),
        }
    }
}

#[async_trait]
impl EmulationContext for VirtualContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(
            *self
                .virtual_time_ns
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance_time(duration);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
