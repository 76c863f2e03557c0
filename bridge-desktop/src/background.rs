//! Timer implementation backed by the Tokio runtime

use async_trait::async_trait;
use bridge_traits::background::Scheduler;
use std::time::Duration;

/// Scheduler that sleeps on the Tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_virtual_time() {
        let scheduler = TokioScheduler;
        let started = tokio::time::Instant::now();

        scheduler.sleep(Duration::from_secs(3)).await;

        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_zero_sleep_returns() {
        let started = Instant::now();
        TokioScheduler.sleep(Duration::ZERO).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
