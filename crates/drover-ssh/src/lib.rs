// drover-ssh: async facade over libssh2.
//
// All libssh2 calls are blocking and run on the tokio blocking pool;
// the session mutex serializes them. Cancellation is cooperative: the
// exec read loop polls a flag between non-blocking reads.

pub mod client;
pub mod probe;
mod transfer;

pub use client::Client;
pub use probe::{ProbeConfig, retry_probe};
