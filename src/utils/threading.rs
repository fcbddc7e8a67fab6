//! # Threading Configuration
//!
//! Bounded rayon pools for ingest workers.

use crate::error::{IbError, Result};

/// Pool of `n_threads` named workers
pub fn build_thread_pool(n_threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads.max(1))
        .thread_name(|i| format!("ibrowser-worker-{}", i))
        .build()
        .map_err(|e| IbError::config(format!("failed to create thread pool: {}", e)))
}

/// Worker count to use when the caller asked for `requested` (0 = all cores)
pub fn resolve_threads(requested: usize) -> usize {
    if requested == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        requested
    }
}
