//! Per-thread execution tracking for the blocked-thread checker

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Identifies one executor thread of a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorId {
    /// Event loop slot index
    EventLoop(usize),
    /// Worker thread index
    Worker(usize),
}

impl ExecutorId {
    /// Whether this is an event loop thread
    pub fn is_event_loop(&self) -> bool {
        matches!(self, ExecutorId::EventLoop(_))
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorId::EventLoop(index) => write!(f, "event-loop-{}", index),
            ExecutorId::Worker(index) => write!(f, "worker-{}", index),
        }
    }
}

/// Point-in-time view of an executor thread
#[derive(Debug, Clone)]
pub struct ExecutorProbe {
    /// Executor id
    pub executor: ExecutorId,
    /// OS thread name
    pub thread_name: String,
    /// How long the current task has been running, None when idle
    pub current_task_elapsed: Option<Duration>,
    /// Tasks run by this thread so far
    pub tasks_run: u64,
}

impl ExecutorProbe {
    /// Current task runtime in milliseconds, None when idle
    pub fn current_task_elapsed_ms(&self) -> Option<u64> {
        self.current_task_elapsed.map(|d| d.as_millis() as u64)
    }
}

/// What an executor thread is doing right now
pub(crate) struct ThreadActivity {
    executor: ExecutorId,
    thread_name: String,
    thread_id: OnceCell<ThreadId>,
    /// When the current task started (None = idle)
    started: Mutex<Option<Instant>>,
    tasks_run: AtomicU64,
}

impl ThreadActivity {
    pub fn new(executor: ExecutorId, thread_name: String) -> Self {
        Self {
            executor,
            thread_name,
            thread_id: OnceCell::new(),
            started: Mutex::new(None),
            tasks_run: AtomicU64::new(0),
        }
    }

    pub fn executor(&self) -> ExecutorId {
        self.executor
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Record the executing thread; called once from the thread itself
    pub fn bind_current_thread(&self) {
        let _ = self.thread_id.set(std::thread::current().id());
    }

    /// Whether the calling thread is this executor's thread
    pub fn is_current_thread(&self) -> bool {
        self.thread_id.get() == Some(&std::thread::current().id())
    }

    pub fn begin(&self) {
        *self.started.lock() = Some(Instant::now());
    }

    pub fn end(&self) {
        *self.started.lock() = None;
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Runtime of the current task as seen at `now`
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        let started = *self.started.lock();
        started.map(|start| now.saturating_duration_since(start))
    }

    pub fn probe(&self, now: Instant) -> ExecutorProbe {
        ExecutorProbe {
            executor: self.executor,
            thread_name: self.thread_name.clone(),
            current_task_elapsed: self.elapsed(now),
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
        }
    }
}
