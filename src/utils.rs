//! Shared helpers for retrying store calls and pacing reconnects.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Result;

/// Exponential backoff delay for a zero-based attempt, capped at `max_ms`.
///
/// # Arguments
///
/// * `attempt` - Number of attempts already made
/// * `initial_ms` - Delay before the first retry
/// * `max_ms` - Upper bound for any single delay
#[must_use]
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let factor = 1_u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
    Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
}

/// Backoff delay with up to 20% random jitter added.
///
/// Concurrent views that lost the same connection spread their reconnects instead of
/// hitting the feed at the same instant.
#[must_use]
pub fn jittered_backoff(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let base = backoff_delay(attempt, initial_ms, max_ms);
    let spread = u64::try_from(base.as_millis() / 5).unwrap_or(0);
    if spread == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=spread);
    base + Duration::from_millis(jitter)
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or `attempts`
/// tries are used up. Only errors for which [`crate::SyncError::is_retryable`] holds
/// are retried.
pub async fn retry_transient<T, F, Fut>(operation_name: &str, attempts: u32, initial_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = jittered_backoff(attempt, initial_ms, initial_ms.saturating_mul(16));
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0, 100, 1_000), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, 100, 1_000), Duration::from_millis(400));
        assert_eq!(backoff_delay(10, 100, 1_000), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(64, 100, 1_000), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_a_fifth() {
        for _ in 0..50 {
            let delay = jittered_backoff(1, 100, 10_000);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(240));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = retry_transient("list_threads", 3, 1, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SyncError::Transient("offline".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = retry_transient("send", 5, 1, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Validation("empty".into()))
        })
        .await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
