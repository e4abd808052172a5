//! Fixed-interval retry waits.
//!
//! Intervals are constant; there is no backoff growth.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default client reconnect interval.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Pause after a failed accept before accepting again.
pub const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Waits a fixed interval between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer {
    interval: Duration,
}

impl RetryTimer {
    /// Timer with a fixed `interval`.
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Time waited between attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep for the interval. Returns `false` if `cancel` fired first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }
}

impl Default for RetryTimer {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_wait_full_interval() {
        let timer = RetryTimer::new(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert!(timer.wait(&cancel).await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        // No growth between attempts
        let start = Instant::now();
        assert!(timer.wait(&cancel).await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled() {
        let timer = RetryTimer::new(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        assert!(!timer.wait(&cancel).await);
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let timer = RetryTimer::new(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!timer.wait(&cancel).await);
    }
}
