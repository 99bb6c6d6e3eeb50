//! Shared helpers for integration tests

#![allow(dead_code)]

use eventide_core::{RuntimeOptions, Scheduler};
use std::sync::Once;
use std::time::Duration;

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Options with the given pool sizes and the blocked-thread checker off
pub fn options(event_loops: usize, workers: usize) -> RuntimeOptions {
    let mut options = RuntimeOptions::with_pool_sizes(event_loops, workers);
    options.blocked_thread_check_enabled = false;
    options
}

/// Start a scheduler for a test
pub fn scheduler(event_loops: usize, workers: usize) -> Scheduler {
    init_tracing();
    Scheduler::new(options(event_loops, workers)).expect("scheduler should start")
}

/// Name of the calling thread
pub fn thread_name() -> String {
    std::thread::current().name().unwrap_or("<unnamed>").to_string()
}
