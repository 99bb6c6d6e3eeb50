//! Executors - Event Loops and Worker Pool
//!
//! Event loops are single-threaded executors, each draining one FIFO
//! channel. The worker pool is a bounded set of threads sharing one
//! channel of work items; ordered lanes ride on top of it so a lane has at
//! most one task in flight.

mod activity;
mod event_loop;
mod task;
mod task_queue;
mod worker_pool;

pub use activity::{ExecutorId, ExecutorProbe};
pub(crate) use activity::ThreadActivity;
pub(crate) use event_loop::{EventLoop, EventLoopGroup};
pub use task::Task;
pub(crate) use task::Envelope;
pub(crate) use task_queue::TaskQueue;
pub(crate) use worker_pool::{WorkItem, WorkerPool};

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Join a thread with timeout, detach if stuck.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    if handle.thread().id() == thread::current().id() {
        // An executor shutting itself down cannot wait for itself
        return false;
    }

    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return true;
        }
        if start.elapsed() > timeout {
            tracing::warn!(
                thread = handle.thread().name().unwrap_or("<unnamed>"),
                "thread did not stop in time, detaching"
            );
            drop(handle);
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
