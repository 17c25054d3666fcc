use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use drover_core::error::{Error, Result};
use drover_pool::PoolManager;
use drover_ssh::{Client, ProbeConfig};

use crate::script;
use crate::spec::{PipelineSpec, Step, StepState};
use crate::state::{self, StepPhase};

/// Readiness probe: the VM can host steps once the container runtime
/// answers.
const READY_PROBE: &str = "docker ps";

/// Staging root and scratch volumes are world-writable so steps can run
/// as any user.
const SHARED_DIR_MODE: u32 = 0o777;

/// Drives the setup/run/destroy lifecycle of a pipeline on a leased VM.
pub struct Engine {
    pools: Arc<PoolManager>,
    probe: ProbeConfig,
}

impl Engine {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            probe: ProbeConfig::default(),
        }
    }

    pub fn with_probe_config(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    /// Lease an instance and prepare it for the pipeline: readiness
    /// probe, staging root, container network, global files, scratch
    /// volumes.
    ///
    /// A failure after the lease does NOT destroy the instance. The
    /// leased id/ip are already recorded on `spec.cloud_instance`, and
    /// the caller owns the `destroy` call on every path.
    pub async fn setup(&self, cancel: &CancellationToken, spec: &mut PipelineSpec) -> Result<()> {
        let pool_name = spec.cloud_instance.pool_name.clone();
        if pool_name.is_empty() {
            return Err(Error::Config("setup: pool name is empty".to_string()));
        }
        let pool = self
            .pools
            .get(&pool_name)
            .await
            .ok_or_else(|| Error::Config(format!("setup: pool '{pool_name}' not found")))?;

        let instance = match self.pools.provision(cancel, &pool_name).await {
            Ok(instance) => instance,
            Err(err) => {
                error!(pool = %pool_name, error = %err, "setup: failed to provision an instance");
                return Err(err);
            }
        };
        spec.cloud_instance.id = instance.id.clone();
        spec.cloud_instance.ip = instance.ip.clone();

        let client = Client::dial(cancel, &instance.ip, pool.user(), pool.private_key()).await?;
        client.await_ready(cancel, &self.probe, READY_PROBE).await?;

        client.mkdir_all(pool.root_dir(), SHARED_DIR_MODE).await?;

        let network = script::network_create_command(pool.os());
        let code = client.exec(cancel, &network, &mut std::io::sink()).await?;
        if code != 0 {
            return Err(Error::Transport(anyhow::anyhow!(
                "setup: {network:?} exited {code}"
            )));
        }

        // Directories first, then file payloads, each in the given order.
        for file in spec.files.iter().filter(|f| f.is_dir) {
            client.mkdir_all(&file.path, file.mode).await?;
        }
        for file in spec.files.iter().filter(|f| !f.is_dir) {
            client.upload(&file.path, file.data.clone(), file.mode).await?;
        }
        for volume in &spec.volumes {
            if let Some(dir) = &volume.empty_dir
                && !dir.id.is_empty()
            {
                client.mkdir_all(&dir.id, SHARED_DIR_MODE).await?;
            }
        }

        debug!(
            pool = %pool_name,
            ip = %spec.cloud_instance.ip,
            id = %spec.cloud_instance.id,
            "setup complete"
        );
        Ok(())
    }

    /// Stage the step's script files and execute its command, streaming
    /// stdout and stderr into `output`.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        spec: &PipelineSpec,
        step: &Step,
        output: &mut (dyn Write + Send),
    ) -> Result<StepState> {
        let pool_name = &spec.cloud_instance.pool_name;
        let pool = self
            .pools
            .get(pool_name)
            .await
            .ok_or_else(|| Error::Config(format!("run: pool '{pool_name}' not found")))?;

        let mut phase = StepPhase::Leased;
        let client =
            Client::dial(cancel, &spec.cloud_instance.ip, pool.user(), pool.private_key()).await?;
        client.await_ready(cancel, &self.probe, READY_PROBE).await?;
        phase = advance(phase, StepPhase::Ready);

        for file in &step.files {
            let data = script::render_step_file(step, pool.os(), file);
            client.upload(&file.path, data, file.mode).await?;
        }
        phase = advance(phase, StepPhase::Staged);

        let command = script::step_command(step);
        debug!(
            pool = %pool_name,
            id = %spec.cloud_instance.id,
            command = %command,
            "step started"
        );
        phase = advance(phase, StepPhase::Running);

        let state = match client.exec(cancel, &command, output).await {
            Ok(code) => {
                advance(
                    phase,
                    if code == 0 { StepPhase::Done } else { StepPhase::Failed },
                );
                StepState {
                    exit_code: code,
                    exited: true,
                    oom_killed: false,
                }
            }
            Err(Error::Cancelled) => {
                advance(phase, StepPhase::Cancelled);
                debug!(
                    pool = %pool_name,
                    id = %spec.cloud_instance.id,
                    "step cancelled; the remote process may outlive the session"
                );
                return Err(Error::Cancelled);
            }
            Err(err) => {
                // The transport died without reporting a remote status.
                warn!(
                    pool = %pool_name,
                    id = %spec.cloud_instance.id,
                    error = %err,
                    "step transport failed, reporting exit 255"
                );
                advance(phase, StepPhase::Failed);
                StepState {
                    exit_code: 255,
                    exited: true,
                    oom_killed: false,
                }
            }
        };

        debug!(
            pool = %pool_name,
            id = %spec.cloud_instance.id,
            exit = state.exit_code,
            "step finished"
        );
        Ok(state)
    }

    /// Hand the pipeline's instance back for destruction.
    pub async fn destroy(&self, cancel: &CancellationToken, spec: &PipelineSpec) -> Result<()> {
        let ci = &spec.cloud_instance;
        debug!(pool = %ci.pool_name, ip = %ci.ip, id = %ci.id, "destroy: start");
        self.pools.destroy(cancel, &ci.pool_name, &ci.id).await?;
        debug!(pool = %ci.pool_name, id = %ci.id, "destroy: complete");
        Ok(())
    }
}

fn advance(from: StepPhase, to: StepPhase) -> StepPhase {
    debug_assert!(
        state::validate_transition(from, to).is_ok(),
        "step phase {from} -> {to}"
    );
    tracing::trace!(from = %from, to = %to, "step phase");
    to
}
