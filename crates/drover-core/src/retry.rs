use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Error;

/// Retry a fallible async operation with exponential backoff.
///
/// - `cancel`: Honored during each attempt and each backoff sleep;
///   `Error::Cancelled` is returned as soon as the token fires.
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: The closure to retry.
pub async fn retry<F, Fut, T>(
    cancel: &CancellationToken,
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    let mut delay = base_delay;

    for attempt in 1..=max_attempts {
        let result = tokio::select! {
            res = f() => res,
            _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
        };
        match result {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
                    }
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let cancel = CancellationToken::new();
        let result = retry(&cancel, 3, Duration::from_millis(1), "test", || async {
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let cancel = CancellationToken::new();
        let count = AtomicU32::new(0);
        let count = &count;
        let result = retry(&cancel, 3, Duration::from_millis(1), "test", || async move {
            let c = count.fetch_add(1, Ordering::SeqCst) + 1;
            if c < 3 {
                anyhow::bail!("not yet");
            }
            Ok(c)
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let cancel = CancellationToken::new();
        let count = AtomicU32::new(0);
        let count = &count;
        let result: Result<i32> =
            retry(&cancel, 3, Duration::from_millis(1), "test", || async move {
                count.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always fails");
            })
            .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_single_attempt() {
        let cancel = CancellationToken::new();
        let result: Result<i32> =
            retry(&cancel, 1, Duration::from_millis(1), "test", || async {
                anyhow::bail!("fail");
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<i32> =
            retry(&cancel, 3, Duration::from_millis(1), "test", || async {
                std::future::pending::<()>().await;
                Ok(0)
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });

        let started = Instant::now();
        let result: Result<i32> =
            retry(&cancel, 3, Duration::from_secs(60), "test", || async {
                anyhow::bail!("fail");
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
