use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use drover_core::error::{Error, Result};

use crate::client::Client;

/// Readiness probe cadence. The defaults give the container runtime
/// two minutes to come up.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 24,
        }
    }
}

/// Re-run `probe` until it reports exit code zero.
///
/// Transport errors and non-zero exits both count as "not ready yet".
/// Returns `ReadinessTimeout` once the attempts are exhausted, or
/// `Cancelled` as soon as the token fires.
pub async fn retry_probe<F, Fut>(
    cancel: &CancellationToken,
    config: &ProbeConfig,
    target: &str,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<i32>>,
{
    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match probe().await {
            Ok(0) => {
                debug!(addr = %target, attempt, "probe succeeded");
                return Ok(());
            }
            Ok(code) => debug!(addr = %target, attempt, code, "probe exited non-zero"),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => debug!(addr = %target, attempt, error = %err, "probe failed"),
        }
        if attempt < config.max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
    Err(Error::ReadinessTimeout {
        target: target.to_string(),
        attempts: config.max_attempts,
    })
}

impl Client {
    /// Block until `command` (typically `docker ps`) exits zero on the
    /// VM, discarding its output.
    pub async fn await_ready(
        &self,
        cancel: &CancellationToken,
        config: &ProbeConfig,
        command: &str,
    ) -> Result<()> {
        let addr = self.addr().to_string();
        retry_probe(cancel, config, &addr, || async move {
            let mut sink = std::io::sink();
            self.exec(cancel, command, &mut sink).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast(attempts: u32) -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_millis(10),
            max_attempts: attempts,
        }
    }

    #[tokio::test]
    async fn test_probe_succeeds_immediately() {
        let cancel = CancellationToken::new();
        let result = retry_probe(&cancel, &fast(3), "vm", || async move { Ok(0) }).await;
        assert!(result.is_ok());
    }

    // Three failures, then success, and the wall time reflects the
    // sleeps in between.
    #[tokio::test]
    async fn test_probe_succeeds_after_failures() {
        let cancel = CancellationToken::new();
        let config = fast(10);
        let count = AtomicU32::new(0);
        let count = &count;
        let started = Instant::now();

        let result = retry_probe(&cancel, &config, "vm", || async move {
            let c = count.fetch_add(1, Ordering::SeqCst) + 1;
            if c <= 3 { Ok(1) } else { Ok(0) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= config.interval * 3);
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let cancel = CancellationToken::new();
        let result = retry_probe(&cancel, &fast(3), "vm", || async move { Ok(127) }).await;
        match result {
            Err(Error::ReadinessTimeout { target, attempts }) => {
                assert_eq!(target, "vm");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_counts_transport_errors_as_not_ready() {
        let cancel = CancellationToken::new();
        let result = retry_probe(&cancel, &fast(2), "vm", || async move {
            Err(Error::Transport(anyhow::anyhow!("connection reset")))
        })
        .await;
        assert!(matches!(result, Err(Error::ReadinessTimeout { .. })));
    }

    #[tokio::test]
    async fn test_probe_cancelled_between_attempts() {
        let cancel = CancellationToken::new();
        let config = ProbeConfig {
            interval: Duration::from_secs(60),
            max_attempts: 100,
        };
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });

        let started = Instant::now();
        let result = retry_probe(&cancel, &config, "vm", || async move { Ok(1) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_probe_propagates_cancellation_from_probe() {
        let cancel = CancellationToken::new();
        let result =
            retry_probe(&cancel, &fast(5), "vm", || async move { Err(Error::Cancelled) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
