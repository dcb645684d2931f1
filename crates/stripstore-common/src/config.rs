//! Configuration for the store
//!
//! A single serde-friendly struct threaded through the store constructor;
//! there is no process-global configuration state.

use serde::{Deserialize, Serialize};

/// Store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Stripe width in bytes for newly created objects
    pub strip_size: u64,
    /// Number of op worker threads
    pub op_threads: usize,
    /// Seconds without worker progress before the watchdog logs a warning
    pub op_thread_timeout_secs: u64,
    /// Treat injected or surfaced I/O read errors as fatal
    pub fail_on_io_error: bool,
    /// Verify source and destination memberships after a collection split
    pub debug_verify_split: bool,
    /// Allow mounting a store with a stale version stamp and rewrite it
    pub do_update: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            strip_size: 4096,
            op_threads: 2,
            op_thread_timeout_secs: 60,
            fail_on_io_error: false,
            debug_verify_split: false,
            do_update: false,
        }
    }
}

impl StoreConfig {
    /// Config with a specific stripe width
    #[must_use]
    pub fn with_strip_size(strip_size: u64) -> Self {
        Self {
            strip_size,
            ..Default::default()
        }
    }
}
