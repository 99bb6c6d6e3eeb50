//! Timer thread
//!
//! One thread per runtime keeps a deadline heap and waits on a condvar
//! until the earliest deadline or a new registration. A due timer is not
//! run here: its handler is posted to the owning context like any other
//! task, so it runs with that context's ordering and may fire late when the
//! context is busy.

use crate::context::{Context, ContextId};
use crate::executor::join_with_timeout;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifier of a timer, valid until it fires (one-shot) or is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TimerId(NEXT_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Shortest delay or period; anything below is raised to it
pub(crate) const MIN_DELAY: Duration = Duration::from_millis(1);

type OnceHandler = Box<dyn FnOnce(TimerId) + Send + 'static>;
type PeriodicHandler = Arc<dyn Fn(TimerId) + Send + Sync + 'static>;

enum TimerAction {
    Once(OnceHandler),
    Periodic {
        period: Duration,
        handler: PeriodicHandler,
    },
}

/// Entry in the timer heap
struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    context: Context,
    action: TimerAction,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    /// Wakes the timer thread on registration or shutdown
    notify: Condvar,
    /// Timers not yet fired or cancelled, with their owning context
    active: Arc<DashMap<TimerId, ContextId>>,
}

/// Timer thread of one runtime
pub(crate) struct TimerService {
    inner: Arc<TimerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Start the timer thread
    pub fn start(prefix: &str) -> std::io::Result<Self> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            notify: Condvar::new(),
            active: Arc::new(DashMap::new()),
        });

        let timer = inner.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-timer", prefix))
            .spawn(move || timer.run_loop())?;

        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Fire `handler` once on `context` after `delay` (at least [`MIN_DELAY`])
    pub fn schedule_once<F>(&self, context: &Context, delay: Duration, handler: F) -> TimerId
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        self.register(context, delay, TimerAction::Once(Box::new(handler)))
    }

    /// Fire `handler` on `context` every `period`, first after one period.
    ///
    /// A zero period would re-arm as already due on every pass, so the
    /// period is raised to [`MIN_DELAY`].
    pub fn schedule_periodic<F>(&self, context: &Context, period: Duration, handler: F) -> TimerId
    where
        F: Fn(TimerId) + Send + Sync + 'static,
    {
        let period = period.max(MIN_DELAY);
        self.register(
            context,
            period,
            TimerAction::Periodic {
                period,
                handler: Arc::new(handler),
            },
        )
    }

    fn register(&self, context: &Context, delay: Duration, action: TimerAction) -> TimerId {
        let id = TimerId::next();
        let delay = delay.max(MIN_DELAY);

        let mut state = self.inner.state.lock();
        if state.shutdown {
            tracing::debug!(timer = %id, context = %context.id(), "timer service stopped, timer dropped");
            return id;
        }
        self.inner.active.insert(id, context.id());
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            context: context.clone(),
            action,
        });
        self.inner.notify.notify_one();
        tracing::trace!(timer = %id, context = %context.id(), ?delay, "timer registered");
        id
    }

    /// Cancel a timer. Returns false if it already fired or never existed.
    ///
    /// An entry the timer thread is firing right now is not in the heap; it
    /// is skipped by the active check instead.
    pub fn cancel(&self, id: TimerId) -> bool {
        if self.inner.active.remove(&id).is_none() {
            return false;
        }
        self.inner.state.lock().heap.retain(|entry| entry.id != id);
        true
    }

    /// Timers not yet fired or cancelled
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Stop the thread and drop every pending timer
    pub fn stop(&self, timeout: Duration) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.heap.clear();
            self.inner.notify.notify_one();
        }
        self.inner.active.clear();

        if let Some(handle) = self.handle.lock().take() {
            join_with_timeout(handle, timeout);
        }
    }
}

impl TimerInner {
    /// Timer thread main loop
    fn run_loop(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while state.heap.peek().is_some_and(|entry| entry.deadline <= now) {
                if let Some(entry) = state.heap.pop() {
                    due.push(entry);
                }
            }

            if !due.is_empty() {
                // Posting takes context locks; never do it under the heap lock
                drop(state);
                let rescheduled: Vec<TimerEntry> =
                    due.into_iter().filter_map(|entry| self.fire(entry)).collect();
                state = self.state.lock();
                if !state.shutdown {
                    let active = &self.active;
                    state
                        .heap
                        .extend(rescheduled.into_iter().filter(|entry| active.contains_key(&entry.id)));
                }
                continue;
            }

            match state.heap.peek().map(|next| next.deadline) {
                Some(deadline) => {
                    self.notify.wait_until(&mut state, deadline);
                }
                None => self.notify.wait(&mut state),
            }
        }

        tracing::debug!("timer thread stopped");
    }

    /// Post a due timer to its context. Returns the entry to re-arm, if periodic.
    fn fire(&self, entry: TimerEntry) -> Option<TimerEntry> {
        let TimerEntry {
            deadline,
            id,
            context,
            action,
        } = entry;

        if !self.active.contains_key(&id) {
            return None;
        }

        match action {
            TimerAction::Once(handler) => {
                self.active.remove(&id);
                if let Err(err) = context.run_on_context(move || handler(id)) {
                    tracing::debug!(timer = %id, context = %context.id(), error = %err, "timer dropped");
                }
                None
            }
            TimerAction::Periodic { period, handler } => {
                let active = self.active.clone();
                let task_handler = handler.clone();
                let posted = context.run_on_context(move || {
                    // Cancelled between posting and running
                    if active.contains_key(&id) {
                        task_handler(id);
                    }
                });

                match posted {
                    Ok(()) => {
                        // Fixed rate, but never catch up on a backlog of missed periods
                        let next = (deadline + period).max(Instant::now());
                        Some(TimerEntry {
                            deadline: next,
                            id,
                            context,
                            action: TimerAction::Periodic { period, handler },
                        })
                    }
                    Err(err) => {
                        self.active.remove(&id);
                        tracing::debug!(timer = %id, context = %context.id(), error = %err, "periodic timer dropped");
                        None
                    }
                }
            }
        }
    }
}
