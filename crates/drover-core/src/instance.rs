use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::time::utc_now;

/// Instance lifecycle state as tracked by the pool manager.
///
/// `Creating` and `Destroying` are placeholder states: they reserve
/// capacity while a provider call is in flight outside the pool's
/// mutation region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Creating,
    Created,
    InUse,
    Hibernated,
    Destroying,
    Destroyed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::InUse => write!(f, "in_use"),
            Self::Hibernated => write!(f, "hibernated"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Validate that a state transition is allowed.
///
/// Returns Ok(()) if the transition is valid, Err with explanation
/// otherwise. Destruction may begin from any state; a destroy is
/// at-least-once, so re-entering `Destroying` is also valid.
pub fn validate_transition(from: InstanceState, to: InstanceState) -> Result<()> {
    if to == InstanceState::Destroying {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        // Provider create completed, instance idles in the pool
        (InstanceState::Creating, InstanceState::Created)
        // Demand create: leased the moment it exists
        | (InstanceState::Creating, InstanceState::InUse)
        // Lease
        | (InstanceState::Created, InstanceState::InUse)
        // Release back to the pool
        | (InstanceState::InUse, InstanceState::Created)
        // Hibernate an idle instance
        | (InstanceState::Created, InstanceState::Hibernated)
        // Wake from hibernation
        | (InstanceState::Hibernated, InstanceState::Created)
        // Provider destroy completed
        | (InstanceState::Destroying, InstanceState::Destroyed)
    );

    if valid {
        Ok(())
    } else {
        bail!("invalid state transition: {} -> {}", from, to)
    }
}

/// A single VM belonging to exactly one pool.
///
/// Identity is the provider-assigned `id`; the `name` is informational.
/// `ip` must be non-empty before the instance may be leased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub ip: String,
    /// Port the on-VM agent listens on, 0 when not applicable.
    #[serde(default)]
    pub port: u16,
    pub pool: String,
    /// Driver kind tag, e.g. "hetzner".
    pub driver: String,
    pub image: String,
    pub size: String,
    pub region: String,
    pub platform: Platform,
    pub state: InstanceState,
    /// Credentials staged onto the VM at create time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
    pub started: String,
    pub updated: String,
    #[serde(default)]
    pub is_hibernated: bool,
}

impl Instance {
    /// Refresh the `updated` timestamp after a bookkeeping change.
    pub fn touch(&mut self) {
        self.updated = utc_now();
    }
}
