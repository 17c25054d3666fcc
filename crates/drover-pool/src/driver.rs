use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use drover_core::instance::Instance;
use drover_core::platform::Platform;

use crate::dev::{DevConfig, DevDriver};
use crate::hetzner::{HetznerConfig, HetznerDriver};

/// Tag identifying which provider backs a pool. This is a closed set:
/// adding a provider means adding a variant here and an arm in the
/// factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Hetzner,
    Dev,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hetzner => write!(f, "hetzner"),
            Self::Dev => write!(f, "dev"),
        }
    }
}

/// Everything a create call needs beyond the driver's own configuration.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub pool_name: String,
    pub runner_name: String,
    pub platform: Platform,
    pub ca_key: Option<String>,
    pub ca_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_cert: Option<String>,
    /// Runner version, stamped into provider tags.
    pub version: String,
}

/// Capability set every provider adapter must satisfy so the pool
/// manager stays provider-agnostic. Implementations are stateless with
/// respect to the pool and must be safe to invoke concurrently.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create one VM. On success the returned instance has a non-empty
    /// provider id and address. A partial create must either complete
    /// or leave the provider in a state where destroy is safe.
    async fn create(&self, cancel: &CancellationToken, opts: &CreateOptions) -> Result<Instance>;

    /// Destroy the named instances. An instance the provider no longer
    /// knows about counts as destroyed.
    async fn destroy(&self, cancel: &CancellationToken, ids: &[String]) -> Result<()>;

    /// Cheap provider reachability check.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;

    /// Provider-side console output for an instance, driver-defined.
    async fn logs(&self, cancel: &CancellationToken, id: &str) -> Result<String>;

    /// Suspend an instance. Drivers declare support via `can_hibernate`.
    async fn hibernate(&self, cancel: &CancellationToken, id: &str, pool: &str) -> Result<()>;

    /// Resume a hibernated instance, returning the (possibly updated) id.
    async fn start(&self, cancel: &CancellationToken, id: &str, pool: &str) -> Result<String>;

    /// Attach provider tags to an instance. Best-effort.
    async fn set_tags(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    fn kind(&self) -> DriverKind;

    fn can_hibernate(&self) -> bool {
        false
    }

    /// Default staging root for pools backed by this driver.
    fn root_dir(&self) -> &str;

    /// Human-readable image/size summary for logs.
    fn instance_type(&self) -> &str;
}

/// Per-driver configuration, tagged by `kind` in the pool config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverConfig {
    Hetzner(HetznerConfig),
    Dev(DevConfig),
}

impl DriverConfig {
    pub fn kind(&self) -> DriverKind {
        match self {
            Self::Hetzner(_) => DriverKind::Hetzner,
            Self::Dev(_) => DriverKind::Dev,
        }
    }

    /// Factory mapping a configured driver kind to its implementation.
    pub fn build(&self) -> Arc<dyn Driver> {
        match self {
            Self::Hetzner(cfg) => Arc::new(HetznerDriver::new(cfg.clone())),
            Self::Dev(cfg) => Arc::new(DevDriver::new(cfg.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_display() {
        assert_eq!(DriverKind::Hetzner.to_string(), "hetzner");
        assert_eq!(DriverKind::Dev.to_string(), "dev");
    }

    #[test]
    fn test_driver_config_tagged_parse() {
        let cfg: DriverConfig = toml::from_str(
            r#"
kind = "hetzner"
token = "secret"
image = "ubuntu-22.04"
server_type = "cx11"
location = "nbg1"
"#,
        )
        .unwrap();
        assert_eq!(cfg.kind(), DriverKind::Hetzner);
    }

    #[test]
    fn test_dev_config_parse_and_build() {
        let cfg: DriverConfig = toml::from_str(r#"kind = "dev""#).unwrap();
        assert_eq!(cfg.kind(), DriverKind::Dev);
        let driver = cfg.build();
        assert_eq!(driver.kind(), DriverKind::Dev);
        assert!(!driver.can_hibernate());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<DriverConfig, _> = toml::from_str(r#"kind = "gcp""#);
        assert!(result.is_err());
    }
}
