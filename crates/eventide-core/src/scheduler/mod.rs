//! Scheduler - runtime entry point
//!
//! The scheduler owns the event loop group, the worker pool, the timer
//! thread and the blocked-thread checker, and hands out contexts bound to
//! them.

mod checker;
#[allow(clippy::module_inception)]
mod scheduler;
mod timer;

pub use checker::{BlockedThreadListener, BlockedThreadReport};
pub use scheduler::{Scheduler, SchedulerStats};
pub(crate) use scheduler::Shared;
pub use timer::TimerId;
