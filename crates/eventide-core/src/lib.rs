//! Eventide Core Runtime
//!
//! This crate provides a context-based task execution runtime:
//! - A fixed pool of single-threaded event loops (round-robin assignment)
//! - A bounded worker pool for blocking work, with ordered per-context lanes
//! - Contexts that pin a unit of work to one event loop or one ordered lane
//! - A per-runtime registry answering "which context is running on this thread"
//! - A blocked-thread checker flagging executors that stall
//! - Timers and deployments layered on top of contexts

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod deployment;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod sync;

pub use config::RuntimeOptions;
pub use context::{AsyncResult, Closing, Context, ContextId, ContextKind, ContextRegistry, ContextStats, DrainPolicy};
pub use deployment::{Deployable, DeploymentId, DeploymentOptions};
pub use error::{BoxError, RuntimeError, RuntimeResult, TaskFailure};
pub use executor::{ExecutorId, ExecutorProbe};
pub use scheduler::{BlockedThreadListener, BlockedThreadReport, Scheduler, SchedulerStats, TimerId};
