use thiserror::Error;

/// Result alias used across the workspace for operations that fail with
/// the runner's error taxonomy.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Operational failures shared across the pool manager, transport, and
/// pipeline engine.
///
/// A non-zero remote exit is deliberately absent: commands that run to
/// completion report their status through the step state, never through
/// `Err`.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing pool, empty pool name, bad runner configuration.
    /// Fatal to the caller and never retried.
    #[error("config: {0}")]
    Config(String),

    /// The cloud API is unreachable or kept failing after the driver
    /// exhausted its own retries.
    #[error("provider unavailable: {0:#}")]
    ProviderUnavailable(anyhow::Error),

    /// A lease was requested while the pool is at max size with no idle
    /// instance. Surfaced immediately; the caller decides whether to
    /// back off.
    #[error("pool '{pool}' exhausted: {max} instances in flight")]
    PoolExhausted { pool: String, max: usize },

    /// The remote readiness probe never exited zero within its budget.
    #[error("'{target}' not ready after {attempts} probes")]
    ReadinessTimeout { target: String, attempts: u32 },

    /// SSH/SFTP dial, session, or I/O failure after readiness.
    #[error("transport: {0:#}")]
    Transport(anyhow::Error),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Map a driver-level `anyhow::Error` into the taxonomy, preserving
    /// a cancellation that the driver observed itself.
    pub fn from_driver(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(Error::Cancelled) => Error::Cancelled,
            Ok(other) => other,
            Err(err) => Error::ProviderUnavailable(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_pool_and_max() {
        let err = Error::PoolExhausted {
            pool: "ubuntu".to_string(),
            max: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("ubuntu"));
        assert!(msg.contains('4'));
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_from_driver_preserves_cancellation() {
        let err = Error::from_driver(anyhow::Error::new(Error::Cancelled));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_from_driver_wraps_plain_errors() {
        let err = Error::from_driver(anyhow::anyhow!("api returned 503"));
        match err {
            Error::ProviderUnavailable(inner) => {
                assert!(inner.to_string().contains("503"));
            }
            other => panic!("expected ProviderUnavailable, got {other}"),
        }
    }

    #[test]
    fn test_readiness_timeout_message() {
        let err = Error::ReadinessTimeout {
            target: "10.0.0.1:22".to_string(),
            attempts: 24,
        };
        assert!(err.to_string().contains("24 probes"));
    }
}
