use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use drover_core::error::Error;
use drover_core::instance::{Instance, InstanceState};
use drover_core::naming;
use drover_core::time::utc_now;

use crate::driver::{CreateOptions, Driver, DriverKind};

/// In-process driver for development and tests.
///
/// Instances materialize after a configurable delay with sequential ids
/// and loopback-adjacent addresses. Failures can be injected per create
/// call, and destroyed ids are recorded for assertions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DevConfig {
    /// How long a create call blocks before the instance exists.
    #[serde(default)]
    pub create_delay_ms: u64,
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

fn default_root_dir() -> String {
    "/tmp/drover".to_string()
}

pub struct DevDriver {
    cfg: DevConfig,
    seq: AtomicU64,
    fail_creates: AtomicU32,
    fail_destroys: AtomicU32,
    destroyed: Mutex<Vec<String>>,
}

impl DevDriver {
    pub fn new(cfg: DevConfig) -> Self {
        Self {
            cfg,
            seq: AtomicU64::new(0),
            fail_creates: AtomicU32::new(0),
            fail_destroys: AtomicU32::new(0),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` destroy calls fail.
    pub fn fail_next_destroys(&self, n: u32) {
        self.fail_destroys.store(n, Ordering::SeqCst);
    }

    /// Ids passed to destroy so far, in call order.
    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl Driver for DevDriver {
    async fn create(&self, cancel: &CancellationToken, opts: &CreateOptions) -> Result<Instance> {
        let delay = Duration::from_millis(self.cfg.create_delay_ms);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
            _ = tokio::time::sleep(delay) => {}
        }

        if self.fail_creates.load(Ordering::SeqCst) > 0 {
            self.fail_creates.fetch_sub(1, Ordering::SeqCst);
            bail!("dev: injected create failure");
        }

        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let now = utc_now();
        let instance = Instance {
            id: format!("dev-{n}"),
            name: naming::instance_name(&opts.runner_name, &opts.pool_name),
            ip: format!("127.0.1.{}", n % 250 + 1),
            port: 0,
            pool: opts.pool_name.clone(),
            driver: DriverKind::Dev.to_string(),
            image: "dev".to_string(),
            size: "dev".to_string(),
            region: "local".to_string(),
            platform: opts.platform.clone(),
            state: InstanceState::Created,
            ca_cert: opts.ca_cert.clone(),
            ca_key: opts.ca_key.clone(),
            tls_cert: opts.tls_cert.clone(),
            tls_key: opts.tls_key.clone(),
            started: now.clone(),
            updated: now,
            is_hibernated: false,
        };
        debug!(id = %instance.id, ip = %instance.ip, "dev instance created");
        Ok(instance)
    }

    async fn destroy(&self, _cancel: &CancellationToken, ids: &[String]) -> Result<()> {
        if self.fail_destroys.load(Ordering::SeqCst) > 0 {
            self.fail_destroys.fetch_sub(1, Ordering::SeqCst);
            bail!("dev: injected destroy failure");
        }
        let mut destroyed = self.destroyed.lock().unwrap_or_else(|p| p.into_inner());
        destroyed.extend(ids.iter().cloned());
        Ok(())
    }

    async fn ping(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn logs(&self, _cancel: &CancellationToken, id: &str) -> Result<String> {
        Ok(format!("dev: no logs recorded for {id}"))
    }

    async fn hibernate(&self, _cancel: &CancellationToken, _id: &str, _pool: &str) -> Result<()> {
        bail!("dev: hibernate is unimplemented")
    }

    async fn start(&self, _cancel: &CancellationToken, _id: &str, _pool: &str) -> Result<String> {
        bail!("dev: start is unimplemented")
    }

    async fn set_tags(
        &self,
        _cancel: &CancellationToken,
        _instance: &Instance,
        _tags: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Dev
    }

    fn root_dir(&self) -> &str {
        &self.cfg.root_dir
    }

    fn instance_type(&self) -> &str {
        "dev"
    }
}
