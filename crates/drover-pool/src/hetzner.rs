use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drover_core::error::Error;
use drover_core::instance::{Instance, InstanceState};
use drover_core::naming;
use drover_core::retry::retry;
use drover_core::time::utc_now;

use crate::driver::{CreateOptions, Driver, DriverKind};

const DEFAULT_API_BASE: &str = "https://api.hetzner.cloud/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Address discovery: first poll immediately, then every 60s until the
/// server reports a public IPv4 or the budget runs out.
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(60);
const MAX_ADDRESS_POLLS: u32 = 10;

const API_ATTEMPTS: u32 = 3;
const API_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Port the on-VM agent listens on.
const AGENT_PORT: u16 = 9079;

/// Hetzner Cloud driver configuration, one per pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerConfig {
    pub token: String,
    pub image: String,
    pub server_type: String,
    pub location: String,
    /// Names or ids of SSH keys already uploaded to the project.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    /// Overridable for tests against a local endpoint.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_root_dir() -> String {
    "/tmp/drover".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

/// Driver over the Hetzner Cloud v1 HTTP API.
///
/// Firewall management is intentionally absent: inbound rules for the
/// runner are an account-level concern, not a per-instance one.
pub struct HetznerDriver {
    cfg: HetznerConfig,
    http: reqwest::Client,
    instance_type: String,
}

impl HetznerDriver {
    pub fn new(cfg: HetznerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        let instance_type = format!("{}/{}", cfg.image, cfg.server_type);
        Self {
            cfg,
            http,
            instance_type,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.api_base, path)
    }

    async fn get_server(&self, id: &str) -> Result<Server> {
        let resp = self
            .http
            .get(self.url(&format!("/servers/{id}")))
            .bearer_auth(&self.cfg.token)
            .send()
            .await
            .context("hetzner: server lookup request failed")?;
        Ok(parse_response::<ServerEnvelope>(resp).await?.server)
    }
}

/// Labels attached to every server so a reconciliation sweep can find
/// instances this runner created.
fn base_labels(opts: &CreateOptions) -> HashMap<String, String> {
    HashMap::from([
        ("managed-by".to_string(), "drover".to_string()),
        ("runner".to_string(), opts.runner_name.clone()),
        ("pool".to_string(), opts.pool_name.clone()),
        ("version".to_string(), opts.version.clone()),
    ])
}

#[async_trait]
impl Driver for HetznerDriver {
    async fn create(&self, cancel: &CancellationToken, opts: &CreateOptions) -> Result<Instance> {
        let name = naming::instance_name(&opts.runner_name, &opts.pool_name);
        info!(
            driver = %DriverKind::Hetzner,
            pool = %opts.pool_name,
            image = %self.cfg.image,
            name = %name,
            "creating instance"
        );

        let body = json!({
            "name": name,
            "image": self.cfg.image,
            "server_type": self.cfg.server_type,
            "location": self.cfg.location,
            "ssh_keys": self.cfg.ssh_keys,
            "user_data": self.cfg.user_data,
            "labels": base_labels(opts),
        });

        let body = &body;
        let created = retry(cancel, API_ATTEMPTS, API_RETRY_DELAY, "hetzner server create", || {
            async move {
                let resp = self
                    .http
                    .post(self.url("/servers"))
                    .bearer_auth(&self.cfg.token)
                    .json(body)
                    .send()
                    .await
                    .context("hetzner: create request failed")?;
                parse_response::<ServerEnvelope>(resp).await
            }
        })
        .await?;

        let id = created.server.id.to_string();
        let now = utc_now();
        let mut instance = Instance {
            id: id.clone(),
            name,
            ip: String::new(),
            port: AGENT_PORT,
            pool: opts.pool_name.clone(),
            driver: DriverKind::Hetzner.to_string(),
            image: self.cfg.image.clone(),
            size: self.cfg.server_type.clone(),
            region: self.cfg.location.clone(),
            platform: opts.platform.clone(),
            state: InstanceState::Creating,
            ca_cert: opts.ca_cert.clone(),
            ca_key: opts.ca_key.clone(),
            tls_cert: opts.tls_cert.clone(),
            tls_key: opts.tls_key.clone(),
            started: now.clone(),
            updated: now,
            is_hibernated: false,
        };

        // The address is allocated asynchronously on the provider side.
        let mut delay = Duration::ZERO;
        for _ in 0..MAX_ADDRESS_POLLS {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(name = %instance.name, id = %id, "cancelled while waiting for address");
                    return Err(Error::Cancelled.into());
                }
                _ = tokio::time::sleep(delay) => {
                    delay = ADDRESS_POLL_INTERVAL;
                    let server = self.get_server(&id).await?;
                    if let Some(ip) = server.public_ipv4() {
                        instance.ip = ip;
                        instance.state = InstanceState::Created;
                        instance.touch();
                        info!(id = %instance.id, ip = %instance.ip, "instance created");
                        return Ok(instance);
                    }
                    debug!(name = %instance.name, id = %id, "no public address yet");
                }
            }
        }

        bail!(
            "hetzner: server {} has no public address after {} polls",
            id,
            MAX_ADDRESS_POLLS
        )
    }

    async fn destroy(&self, cancel: &CancellationToken, ids: &[String]) -> Result<()> {
        for id in ids {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled.into());
            }
            let url = self.url(&format!("/servers/{id}"));
            let url = &url;
            let status = retry(cancel, API_ATTEMPTS, API_RETRY_DELAY, "hetzner server delete", || {
                async move {
                    let resp = self
                        .http
                        .delete(url.as_str())
                        .bearer_auth(&self.cfg.token)
                        .send()
                        .await
                        .context("hetzner: delete request failed")?;
                    let status = resp.status();
                    if status.is_server_error() {
                        bail!("hetzner: api returned {status}");
                    }
                    Ok(status)
                }
            })
            .await?;

            if status == reqwest::StatusCode::NOT_FOUND {
                warn!(id = %id, "server does not exist, destroy treated as success");
            } else if !status.is_success() {
                bail!("hetzner: delete of server {id} returned {status}");
            } else {
                debug!(id = %id, "server deleted");
            }
        }
        Ok(())
    }

    async fn ping(&self, _cancel: &CancellationToken) -> Result<()> {
        let resp = self
            .http
            .get(self.url("/servers"))
            .query(&[("per_page", "1")])
            .bearer_auth(&self.cfg.token)
            .send()
            .await
            .context("hetzner: ping request failed")?;
        if !resp.status().is_success() {
            bail!("hetzner: ping returned {}", resp.status());
        }
        Ok(())
    }

    async fn logs(&self, _cancel: &CancellationToken, _id: &str) -> Result<String> {
        Ok("hetzner does not expose console logs over the api".to_string())
    }

    async fn hibernate(&self, _cancel: &CancellationToken, _id: &str, _pool: &str) -> Result<()> {
        bail!("hetzner: hibernate is unimplemented")
    }

    async fn start(&self, _cancel: &CancellationToken, _id: &str, _pool: &str) -> Result<String> {
        bail!("hetzner: start is unimplemented")
    }

    async fn set_tags(
        &self,
        _cancel: &CancellationToken,
        instance: &Instance,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        let resp = self
            .http
            .put(self.url(&format!("/servers/{}", instance.id)))
            .bearer_auth(&self.cfg.token)
            .json(&json!({ "labels": tags }))
            .send()
            .await
            .context("hetzner: label update request failed")?;
        if !resp.status().is_success() {
            bail!("hetzner: label update returned {}", resp.status());
        }
        Ok(())
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Hetzner
    }

    fn root_dir(&self) -> &str {
        &self.cfg.root_dir
    }

    fn instance_type(&self) -> &str {
        &self.instance_type
    }
}

async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("hetzner: api returned {status}: {body}");
    }
    resp.json::<T>()
        .await
        .context("hetzner: malformed api response")
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: u64,
    #[serde(default)]
    public_net: PublicNet,
}

#[derive(Debug, Default, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

impl Server {
    fn public_ipv4(&self) -> Option<String> {
        self.public_net
            .ipv4
            .as_ref()
            .map(|v| v.ip.clone())
            .filter(|ip| !ip.is_empty())
    }
}
