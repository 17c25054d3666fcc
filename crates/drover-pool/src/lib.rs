// drover-pool: provider-agnostic warm-pool scheduling.
//
// The manager keeps each pool's population within [min_size, max_size],
// arbitrates concurrent leases, and refills asynchronously. Provider
// calls always happen outside the pool's mutation region; placeholder
// entries in Creating/Destroying reserve capacity in the meantime.

pub mod config;
pub mod dev;
pub mod driver;
pub mod hetzner;
pub mod manager;
pub mod pool;

pub use config::RunnerConfig;
pub use driver::{CreateOptions, Driver, DriverConfig, DriverKind};
pub use manager::{BatchResult, PoolManager};
pub use pool::{Pool, PoolCounts, PoolSettings};
