//! Core environment context trait for the SkyMesh coordinator.

use async_trait::async_trait;
use std::time::Duration;

/// The central interface for time.
///
/// The scheduler paces simulated steps against this clock, so the same loop
/// runs against the wall clock in production and against a virtual clock in
/// tests, where pacing can be checked without actually waiting.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `VirtualContext` (skymesh_sim) - manual virtual clock
#[async_trait]
pub trait EmulationContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Returns the seed used for every random decision of the run
    /// (damage selection). Production contexts return the configured seed.
    fn seed(&self) -> u64;
}
