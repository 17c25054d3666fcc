use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use drover_core::error::{Error, Result};
use drover_core::instance::{Instance, InstanceState};
use drover_core::naming;
use drover_core::platform::{OsKind, Platform};

use crate::driver::Driver;

/// Immutable pool configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub name: String,
    pub min_size: usize,
    pub max_size: usize,
    pub platform: Platform,
    pub user: String,
    pub private_key: String,
    /// Staging root on the VM. Empty means "use the driver default".
    pub root_dir: String,
}

impl PoolSettings {
    fn validate(&self) -> Result<()> {
        naming::validate_id(&self.name, "Pool").map_err(|e| Error::Config(e.to_string()))?;
        if self.max_size == 0 {
            return Err(Error::Config(format!(
                "pool '{}': max_size must be at least 1",
                self.name
            )));
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!(
                "pool '{}': min_size {} exceeds max_size {}",
                self.name, self.min_size, self.max_size
            )));
        }
        if self.user.is_empty() {
            return Err(Error::Config(format!("pool '{}': user is empty", self.name)));
        }
        Ok(())
    }
}

/// Mutable bookkeeping, only ever touched under the pool's mutex.
#[derive(Default)]
pub(crate) struct PoolState {
    pub instances: HashMap<String, Instance>,
    /// Debounce flag: true while a repopulation task is running.
    pub refilling: bool,
}

impl PoolState {
    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.values().filter(|i| i.state == state).count()
    }

    /// Instances that occupy capacity: Creating + Created + InUse.
    /// Destroying entries are already on their way out.
    pub fn in_flight(&self) -> usize {
        self.instances
            .values()
            .filter(|i| {
                matches!(
                    i.state,
                    InstanceState::Creating | InstanceState::Created | InstanceState::InUse
                )
            })
            .count()
    }

    /// Id of an idle instance, if any.
    pub fn idle_id(&self) -> Option<String> {
        self.instances
            .values()
            .find(|i| i.state == InstanceState::Created)
            .map(|i| i.id.clone())
    }
}

/// Point-in-time population counts, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounts {
    pub creating: usize,
    pub created: usize,
    pub in_use: usize,
    pub destroying: usize,
}

impl PoolCounts {
    pub fn in_flight(&self) -> usize {
        self.creating + self.created + self.in_use
    }
}

impl std::fmt::Display for PoolCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "creating={} created={} in_use={} destroying={}",
            self.creating, self.created, self.in_use, self.destroying
        )
    }
}

/// A named group of interchangeable VMs produced by one driver.
///
/// The instance set is modified only through [`crate::PoolManager`]
/// methods, each of which holds the pool's mutex (its mutation region)
/// for the duration of the bookkeeping change.
pub struct Pool {
    settings: PoolSettings,
    driver: Arc<dyn Driver>,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(settings: PoolSettings, driver: Arc<dyn Driver>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            driver,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn min_size(&self) -> usize {
        self.settings.min_size
    }

    pub fn max_size(&self) -> usize {
        self.settings.max_size
    }

    pub fn os(&self) -> OsKind {
        self.settings.platform.os
    }

    pub fn platform(&self) -> &Platform {
        &self.settings.platform
    }

    pub fn user(&self) -> &str {
        &self.settings.user
    }

    pub fn private_key(&self) -> &str {
        &self.settings.private_key
    }

    pub fn root_dir(&self) -> &str {
        if self.settings.root_dir.is_empty() {
            self.driver.root_dir()
        } else {
            &self.settings.root_dir
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().await
    }

    /// Snapshot the population counts.
    pub async fn counts(&self) -> PoolCounts {
        let state = self.state.lock().await;
        PoolCounts {
            creating: state.count(InstanceState::Creating),
            created: state.count(InstanceState::Created),
            in_use: state.count(InstanceState::InUse),
            destroying: state.count(InstanceState::Destroying),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::{DevConfig, DevDriver};

    fn settings(name: &str, min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            name: name.to_string(),
            min_size: min,
            max_size: max,
            platform: Platform::default(),
            user: "root".to_string(),
            private_key: "key".to_string(),
            root_dir: String::new(),
        }
    }

    fn dev_driver() -> Arc<dyn Driver> {
        Arc::new(DevDriver::new(DevConfig::default()))
    }

    #[test]
    fn test_pool_new_validates_sizes() {
        assert!(Pool::new(settings("ok", 1, 2), dev_driver()).is_ok());
        assert!(Pool::new(settings("zero-max", 0, 0), dev_driver()).is_err());
        assert!(Pool::new(settings("inverted", 3, 1), dev_driver()).is_err());
    }

    #[test]
    fn test_pool_new_validates_name_and_user() {
        assert!(Pool::new(settings("Bad Name", 0, 1), dev_driver()).is_err());
        let mut s = settings("no-user", 0, 1);
        s.user.clear();
        assert!(Pool::new(s, dev_driver()).is_err());
    }

    #[test]
    fn test_root_dir_falls_back_to_driver() {
        let pool = Pool::new(settings("fallback", 0, 1), dev_driver()).unwrap();
        assert_eq!(pool.root_dir(), "/tmp/drover");

        let mut s = settings("explicit", 0, 1);
        s.root_dir = "/srv/ci".to_string();
        let pool = Pool::new(s, dev_driver()).unwrap();
        assert_eq!(pool.root_dir(), "/srv/ci");
    }

    #[tokio::test]
    async fn test_counts_start_empty() {
        let pool = Pool::new(settings("empty", 0, 4), dev_driver()).unwrap();
        let counts = pool.counts().await;
        assert_eq!(counts, PoolCounts::default());
        assert_eq!(counts.in_flight(), 0);
    }

    #[test]
    fn test_counts_display() {
        let counts = PoolCounts {
            creating: 1,
            created: 2,
            in_use: 3,
            destroying: 0,
        };
        assert_eq!(
            counts.to_string(),
            "creating=1 created=2 in_use=3 destroying=0"
        );
    }
}
