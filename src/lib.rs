//! # drover — CI pipeline runner on warm cloud VM pools
//!
//! Facade crate that re-exports the drover workspace crates so
//! consumers can depend on a single `drover` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | drover-core | Types, naming, retry, error taxonomy |
//! | [`pool`] | drover-pool | Warm-pool manager, driver contract, drivers |
//! | [`ssh`] | drover-ssh | SSH/SFTP transport and readiness probing |
//! | [`engine`] | drover-engine | Pipeline setup/run/destroy lifecycle |

pub use drover_core as core;
pub use drover_engine as engine;
pub use drover_pool as pool;
pub use drover_ssh as ssh;
