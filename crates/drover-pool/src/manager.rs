use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drover_core::error::{Error, Result};
use drover_core::instance::{Instance, InstanceState};
use drover_core::naming;
use drover_core::time::utc_now;

use crate::driver::{CreateOptions, Driver, DriverKind};
use crate::pool::Pool;

/// Bounded retry for provider create calls during repopulation.
const CREATE_ATTEMPTS: u32 = 3;
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pause between repopulation rounds when an entire batch failed.
const REFILL_BACKOFF: Duration = Duration::from_secs(5);

/// Outcome of an operation that sweeps multiple pools or instances.
/// No single failure aborts the sweep; everything is collected here.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchResult {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Process-wide registry of pools.
///
/// All bookkeeping happens under the owning pool's mutation region;
/// provider calls (`create`, `destroy`) run outside it, with
/// Creating/Destroying placeholders reserving capacity in the meantime.
/// Operations on different pools proceed in parallel.
pub struct PoolManager {
    runner_name: String,
    version: String,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    /// Instances whose provider destroy failed or that could never be
    /// leased. Retried by [`PoolManager::reap_leaked`]; destroy is
    /// at-least-once.
    leaked: StdMutex<Vec<(String, String)>>,
    /// Fired on teardown so background repopulation stops.
    shutdown: CancellationToken,
}

impl PoolManager {
    pub fn new(runner_name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let runner_name = runner_name.into();
        naming::validate_id(&runner_name, "Runner").map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            runner_name,
            version: version.into(),
            pools: RwLock::new(HashMap::new()),
            leaked: StdMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    /// Add a pool to the registry. Fails if the name is taken.
    pub async fn register(&self, pool: Pool) -> Result<()> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(pool.name()) {
            return Err(Error::Config(format!(
                "pool '{}' is already registered",
                pool.name()
            )));
        }
        info!(
            pool = %pool.name(),
            driver = %pool.driver().kind(),
            min = pool.min_size(),
            max = pool.max_size(),
            "pool registered"
        );
        pools.insert(pool.name().to_string(), Arc::new(pool));
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().await.get(name).cloned()
    }

    async fn require(&self, name: &str) -> Result<Arc<Pool>> {
        if name.is_empty() {
            return Err(Error::Config("pool name is empty".to_string()));
        }
        self.get(name)
            .await
            .ok_or_else(|| Error::Config(format!("pool '{name}' is not registered")))
    }

    fn create_options(&self, pool: &Pool) -> CreateOptions {
        CreateOptions {
            pool_name: pool.name().to_string(),
            runner_name: self.runner_name.clone(),
            platform: pool.platform().clone(),
            ca_key: None,
            ca_cert: None,
            tls_key: None,
            tls_cert: None,
            version: self.version.clone(),
        }
    }

    /// Lease one instance from the named pool.
    ///
    /// Prefers an idle `Created` instance; otherwise creates on demand
    /// while capacity remains, else fails immediately with
    /// `PoolExhausted`. Every successful lease schedules asynchronous
    /// repopulation.
    pub async fn provision(&self, cancel: &CancellationToken, pool_name: &str) -> Result<Instance> {
        let pool = self.require(pool_name).await?;

        let placeholder_id;
        {
            let mut state = pool.lock_state().await;
            if let Some(id) = state.idle_id() {
                if let Some(inst) = state.instances.get_mut(&id) {
                    inst.state = InstanceState::InUse;
                    inst.touch();
                    let leased = inst.clone();
                    drop(state);
                    info!(pool = %pool_name, id = %leased.id, ip = %leased.ip, "leased idle instance");
                    self.schedule_refill(&pool);
                    return Ok(leased);
                }
            }
            if state.in_flight() >= pool.max_size() {
                return Err(Error::PoolExhausted {
                    pool: pool_name.to_string(),
                    max: pool.max_size(),
                });
            }
            let ph = placeholder(&pool);
            placeholder_id = ph.id.clone();
            state.instances.insert(placeholder_id.clone(), ph);
        }

        debug!(pool = %pool_name, "no idle instance, creating on demand");
        let opts = self.create_options(&pool);
        let created = tokio::select! {
            res = pool.driver().create(cancel, &opts) => res,
            _ = cancel.cancelled() => Err(Error::Cancelled.into()),
        };

        let mut state = pool.lock_state().await;
        state.instances.remove(&placeholder_id);
        match created {
            Ok(mut inst) if !inst.id.is_empty() && !inst.ip.is_empty() => {
                inst.state = InstanceState::InUse;
                inst.pool = pool_name.to_string();
                inst.touch();
                state.instances.insert(inst.id.clone(), inst.clone());
                drop(state);
                info!(pool = %pool_name, id = %inst.id, ip = %inst.ip, "leased new instance");
                self.schedule_refill(&pool);
                Ok(inst)
            }
            Ok(inst) => {
                drop(state);
                if !inst.id.is_empty() {
                    self.record_leak(pool_name, &inst.id);
                }
                Err(Error::ProviderUnavailable(anyhow::anyhow!(
                    "created instance {:?} cannot be leased without an address",
                    inst.id
                )))
            }
            Err(err) => {
                drop(state);
                Err(Error::from_driver(err))
            }
        }
    }

    /// Destroy one instance. Ids the provider no longer knows about
    /// count as destroyed; ids missing from bookkeeping are still sent
    /// to the provider (at-least-once).
    pub async fn destroy(
        &self,
        cancel: &CancellationToken,
        pool_name: &str,
        id: &str,
    ) -> Result<()> {
        let pool = self.require(pool_name).await?;
        {
            let mut state = pool.lock_state().await;
            if let Some(inst) = state.instances.get_mut(id) {
                inst.state = InstanceState::Destroying;
                inst.touch();
            } else {
                debug!(pool = %pool_name, id = %id, "destroying instance unknown to bookkeeping");
            }
        }

        let ids = [id.to_string()];
        let result = pool.driver().destroy(cancel, &ids).await;
        match result {
            Ok(()) => {
                {
                    let mut state = pool.lock_state().await;
                    if let Some(inst) = state.instances.get_mut(id) {
                        inst.state = InstanceState::Destroyed;
                        inst.touch();
                    }
                    state.instances.remove(id);
                }
                info!(pool = %pool_name, id = %id, "instance destroyed");
                self.schedule_refill(&pool);
                Ok(())
            }
            Err(err) => {
                // The entry stays in Destroying (no capacity held) and is
                // retried by the next reap.
                self.record_leak(pool_name, id);
                warn!(pool = %pool_name, id = %id, error = %err, "destroy failed");
                Err(Error::from_driver(err))
            }
        }
    }

    /// Destroy every instance in every pool: parallel across pools,
    /// one batched provider call per pool. Collects all failures.
    pub async fn destroy_all(&self, cancel: &CancellationToken) -> BatchResult {
        self.shutdown.cancel();
        let pools: Vec<Arc<Pool>> = self.pools.read().await.values().cloned().collect();

        let mut tasks = Vec::with_capacity(pools.len());
        for pool in pools {
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let name = pool.name().to_string();
                let ids: Vec<String> = {
                    let mut state = pool.lock_state().await;
                    let ids = state
                        .instances
                        .values()
                        .filter(|i| i.state != InstanceState::Creating)
                        .map(|i| i.id.clone())
                        .collect::<Vec<_>>();
                    for inst in state.instances.values_mut() {
                        if inst.state != InstanceState::Creating {
                            inst.state = InstanceState::Destroying;
                            inst.touch();
                        }
                    }
                    ids
                };
                if ids.is_empty() {
                    return (name, Ok(0));
                }
                match pool.driver().destroy(&cancel, &ids).await {
                    Ok(()) => {
                        let mut state = pool.lock_state().await;
                        for id in &ids {
                            if let Some(inst) = state.instances.get_mut(id) {
                                inst.state = InstanceState::Destroyed;
                                inst.touch();
                            }
                            state.instances.remove(id);
                        }
                        (name, Ok(ids.len()))
                    }
                    Err(err) => (name, Err(err.to_string())),
                }
            }));
        }

        let mut result = BatchResult::default();
        for task in tasks {
            match task.await {
                Ok((name, Ok(n))) => {
                    info!(pool = %name, destroyed = n, "pool drained");
                    result.succeeded.push(name);
                }
                Ok((name, Err(err))) => {
                    warn!(pool = %name, error = %err, "pool teardown failed");
                    result.failed.push((name, err));
                }
                Err(err) => {
                    warn!(error = %err, "pool teardown task panicked");
                    result.failed.push(("unknown".to_string(), err.to_string()));
                }
            }
        }
        result
    }

    /// Forward a reachability check to an arbitrary pool backed by the
    /// given driver kind.
    pub async fn ping(&self, cancel: &CancellationToken, kind: DriverKind) -> Result<()> {
        let pool = {
            let pools = self.pools.read().await;
            pools
                .values()
                .find(|p| p.driver().kind() == kind)
                .cloned()
                .ok_or_else(|| Error::Config(format!("no pool backed by driver '{kind}'")))?
        };
        pool.driver().ping(cancel).await.map_err(Error::from_driver)
    }

    /// Bring every pool up to min size at startup: creates run in
    /// parallel within and across pools. Partial success is fine;
    /// repopulation retries later.
    pub async fn build_pools(&self, cancel: &CancellationToken) -> BatchResult {
        let pools: Vec<Arc<Pool>> = self.pools.read().await.values().cloned().collect();

        let mut tasks = Vec::with_capacity(pools.len());
        for pool in pools {
            let opts = self.create_options(&pool);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let name = pool.name().to_string();
                let (created, errors) = refill_batch(&pool, &opts, &cancel).await;
                (name, created, errors)
            }));
        }

        let mut result = BatchResult::default();
        for task in tasks {
            match task.await {
                Ok((name, created, errors)) => {
                    info!(pool = %name, created, failures = errors.len(), "pool built");
                    if errors.is_empty() {
                        result.succeeded.push(name);
                    } else {
                        result.failed.push((name, errors.join("; ")));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "pool build task panicked");
                    result.failed.push(("unknown".to_string(), err.to_string()));
                }
            }
        }
        result
    }

    /// Retry every recorded leak plus anything stuck in `Destroying`.
    pub async fn reap_leaked(&self, cancel: &CancellationToken) -> BatchResult {
        let mut pending: Vec<(String, String)> = {
            let mut leaked = self.leaked.lock().unwrap_or_else(|p| p.into_inner());
            leaked.drain(..).collect()
        };

        let pools: Vec<Arc<Pool>> = self.pools.read().await.values().cloned().collect();
        for pool in &pools {
            let state = pool.lock_state().await;
            for inst in state.instances.values() {
                if inst.state == InstanceState::Destroying {
                    pending.push((pool.name().to_string(), inst.id.clone()));
                }
            }
        }
        pending.sort();
        pending.dedup();

        let mut result = BatchResult::default();
        for (pool_name, id) in pending {
            match self.destroy(cancel, &pool_name, &id).await {
                Ok(()) => result.succeeded.push(id),
                Err(err) => result.failed.push((id, err.to_string())),
            }
        }
        result
    }

    fn record_leak(&self, pool_name: &str, id: &str) {
        info!(pool = %pool_name, id = %id, "recording leaked instance for reap");
        let mut leaked = self.leaked.lock().unwrap_or_else(|p| p.into_inner());
        leaked.push((pool_name.to_string(), id.to_string()));
    }

    /// Kick the pool's repopulation task. A running task debounces
    /// additional wakeups; it re-evaluates the deficit after each batch.
    fn schedule_refill(&self, pool: &Arc<Pool>) {
        let pool = Arc::clone(pool);
        let opts = self.create_options(&pool);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            {
                let mut state = pool.lock_state().await;
                if state.refilling {
                    return;
                }
                state.refilling = true;
            }
            loop {
                if shutdown.is_cancelled() {
                    pool.lock_state().await.refilling = false;
                    return;
                }
                let (created, errors) = refill_batch(&pool, &opts, &shutdown).await;
                if !errors.is_empty() {
                    warn!(
                        pool = %pool.name(),
                        failures = errors.len(),
                        "repopulation batch had failures"
                    );
                }

                // Clear the debounce flag under the same lock that shows
                // the deficit satisfied, so a racing lease re-arms us.
                let mut state = pool.lock_state().await;
                let idle =
                    state.count(InstanceState::Created) + state.count(InstanceState::Creating);
                let capacity_left = pool.max_size().saturating_sub(state.in_flight());
                if idle >= pool.min_size() || capacity_left == 0 {
                    state.refilling = false;
                    return;
                }
                drop(state);

                if created == 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(REFILL_BACKOFF) => {}
                        _ = shutdown.cancelled() => {
                            pool.lock_state().await.refilling = false;
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Reservation entry occupying capacity while a provider create runs
/// outside the mutation region.
fn placeholder(pool: &Pool) -> Instance {
    let now = utc_now();
    Instance {
        id: naming::reservation_id(),
        name: String::new(),
        ip: String::new(),
        port: 0,
        pool: pool.name().to_string(),
        driver: pool.driver().kind().to_string(),
        image: String::new(),
        size: String::new(),
        region: String::new(),
        platform: pool.platform().clone(),
        state: InstanceState::Creating,
        ca_cert: None,
        ca_key: None,
        tls_cert: None,
        tls_key: None,
        started: now.clone(),
        updated: now,
        is_hibernated: false,
    }
}

/// One repopulation round: register up to `deficit` placeholders under
/// the region, then create in parallel with bounded retry. Returns the
/// number of instances that reached `Created` and the failures.
async fn refill_batch(
    pool: &Arc<Pool>,
    opts: &CreateOptions,
    cancel: &CancellationToken,
) -> (usize, Vec<String>) {
    let placeholders: Vec<String> = {
        let mut state = pool.lock_state().await;
        let idle = state.count(InstanceState::Created) + state.count(InstanceState::Creating);
        let deficit = pool.min_size().saturating_sub(idle);
        let capacity = pool.max_size().saturating_sub(state.in_flight());
        (0..deficit.min(capacity))
            .map(|_| {
                let ph = placeholder(pool);
                let id = ph.id.clone();
                state.instances.insert(id.clone(), ph);
                id
            })
            .collect()
    };
    if placeholders.is_empty() {
        return (0, Vec::new());
    }
    debug!(pool = %pool.name(), count = placeholders.len(), "repopulating");

    let mut handles = Vec::with_capacity(placeholders.len());
    for ph_id in placeholders {
        let pool = Arc::clone(pool);
        let opts = opts.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let created = create_with_retry(&pool, &opts, &cancel).await;

            let mut state = pool.lock_state().await;
            state.instances.remove(&ph_id);
            match created {
                Ok(mut inst) if !inst.ip.is_empty() && !cancel.is_cancelled() => {
                    inst.state = InstanceState::Created;
                    inst.pool = pool.name().to_string();
                    inst.touch();
                    debug!(pool = %pool.name(), id = %inst.id, "instance ready in pool");
                    state.instances.insert(inst.id.clone(), inst);
                    Ok(())
                }
                Ok(inst) => {
                    drop(state);
                    // Either unleasable without an address, or it raced a
                    // teardown. Don't let it linger.
                    let reap = CancellationToken::new();
                    let _ = pool.driver().destroy(&reap, &[inst.id.clone()]).await;
                    Err(format!("instance {} was unusable, destroyed", inst.id))
                }
                Err(err) => Err(format!("{err:#}")),
            }
        }));
    }

    let mut created = 0;
    let mut errors = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => created += 1,
            Ok(Err(err)) => errors.push(err),
            Err(err) => errors.push(err.to_string()),
        }
    }
    (created, errors)
}

/// Provider create with bounded exponential backoff. Cancellation is
/// never retried.
async fn create_with_retry(
    pool: &Arc<Pool>,
    opts: &CreateOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<Instance> {
    let mut delay = CREATE_RETRY_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pool.driver().create(cancel, opts).await {
            Ok(inst) => return Ok(inst),
            Err(err) => {
                let cancelled = matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled));
                if cancelled || attempt >= CREATE_ATTEMPTS {
                    return Err(err);
                }
                warn!(
                    pool = %pool.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "instance create failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
                }
                delay *= 2;
            }
        }
    }
}
