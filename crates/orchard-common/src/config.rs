//! Configuration structures for the Orchard plotter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behavior for transient I/O failures.
///
/// The plotter never gives up on transient errors: long plots must survive
/// a disk that disappears for a while. Tests inject a short backoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Sleep between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// A policy suitable for tests: near-immediate retry.
    pub fn immediate() -> Self {
        Self {
            backoff: Duration::from_millis(1),
        }
    }
}

/// Tunable parameters for a plotting run.
///
/// The defaults match the documented command surface; zero means "pick
/// automatically" where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotterConfig {
    /// Memory budget for sort buffers, in MiB.
    pub buf_megabytes: u32,
    /// Number of sort buckets; 0 derives a count from the memory budget.
    pub num_buckets: u32,
    /// Entries per phase-1 scan stripe.
    pub stripe_size: u64,
    /// Worker threads for phase 1.
    pub num_threads: u8,
    /// Use the rewriting back-propagation variant instead of bitfields.
    pub no_bitfield: bool,
    /// Transient I/O retry behavior.
    pub retry: RetryPolicy,
}

impl Default for PlotterConfig {
    fn default() -> Self {
        Self {
            buf_megabytes: 4608,
            num_buckets: 0,
            stripe_size: 65536,
            num_threads: 2,
            no_bitfield: false,
            retry: RetryPolicy::default(),
        }
    }
}
