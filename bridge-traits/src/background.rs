//! Timer Abstraction
//!
//! Polling loops and retry back-off sleep through an injected [`Scheduler`]
//! so tests can run them without waiting on real timers.

use async_trait::async_trait;
use std::time::Duration;

/// Sleep source for periodic work and retry delays.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::background::Scheduler;
///
/// async fn poll(scheduler: &dyn Scheduler) {
///     loop {
///         // ... do work ...
///         scheduler.sleep(Duration::from_secs(10)).await;
///     }
/// }
/// ```
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}
