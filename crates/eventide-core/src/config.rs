//! Runtime configuration
//!
//! Options can be built in code or loaded from a TOML document. Every field
//! has a default, so a partial document only overrides what it names:
//!
//! ```toml
//! event_loop_pool_size = 4
//! worker_pool_size = 8
//! max_event_loop_execute_time_ms = 500
//! ```

use crate::error::{RuntimeError, RuntimeResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default number of worker threads
pub const DEFAULT_WORKER_POOL_SIZE: usize = 20;

/// Default budget for a single event loop task before it is reported as blocking
pub const DEFAULT_MAX_EVENT_LOOP_EXECUTE_TIME: Duration = Duration::from_millis(2000);

/// Default budget for a single worker task before it is reported as blocking
pub const DEFAULT_MAX_WORKER_EXECUTE_TIME: Duration = Duration::from_secs(60);

/// Default period of the blocked-thread checker
pub const DEFAULT_BLOCKED_THREAD_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Options for creating a [`Scheduler`](crate::Scheduler)
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeOptions {
    /// Number of event loop threads
    pub event_loop_pool_size: usize,

    /// Number of worker threads
    pub worker_pool_size: usize,

    /// Event loop task budget in milliseconds
    pub max_event_loop_execute_time_ms: u64,

    /// Worker task budget in milliseconds
    pub max_worker_execute_time_ms: u64,

    /// Blocked-thread checker period in milliseconds
    pub blocked_thread_check_interval_ms: u64,

    /// Whether the blocked-thread checker runs at all
    pub blocked_thread_check_enabled: bool,

    /// Upper bound on how long shutdown waits for in-flight work
    pub shutdown_timeout_ms: u64,

    /// Prefix used for every thread the runtime spawns
    pub thread_name_prefix: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            event_loop_pool_size: 2 * num_cpus::get(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            max_event_loop_execute_time_ms: DEFAULT_MAX_EVENT_LOOP_EXECUTE_TIME.as_millis() as u64,
            max_worker_execute_time_ms: DEFAULT_MAX_WORKER_EXECUTE_TIME.as_millis() as u64,
            blocked_thread_check_interval_ms: DEFAULT_BLOCKED_THREAD_CHECK_INTERVAL.as_millis()
                as u64,
            blocked_thread_check_enabled: true,
            shutdown_timeout_ms: 5000,
            thread_name_prefix: "eventide".to_string(),
        }
    }
}

impl RuntimeOptions {
    /// Options with explicit pool sizes, everything else default
    pub fn with_pool_sizes(event_loops: usize, workers: usize) -> Self {
        Self {
            event_loop_pool_size: event_loops,
            worker_pool_size: workers,
            ..Default::default()
        }
    }

    /// Parse options from a TOML document
    pub fn from_toml_str(source: &str) -> RuntimeResult<Self> {
        let options: RuntimeOptions = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file
    pub fn load(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject configurations the runtime cannot start with
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.event_loop_pool_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "event_loop_pool_size must be at least 1".to_string(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.blocked_thread_check_enabled && self.blocked_thread_check_interval_ms == 0 {
            return Err(RuntimeError::InvalidConfig(
                "blocked_thread_check_interval_ms must be positive".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Event loop task budget
    pub fn max_event_loop_execute_time(&self) -> Duration {
        Duration::from_millis(self.max_event_loop_execute_time_ms)
    }

    /// Worker task budget
    pub fn max_worker_execute_time(&self) -> Duration {
        Duration::from_millis(self.max_worker_execute_time_ms)
    }

    /// Blocked-thread checker period
    pub fn blocked_thread_check_interval(&self) -> Duration {
        Duration::from_millis(self.blocked_thread_check_interval_ms)
    }

    /// Shutdown wait bound
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
