//! Context handle, lifecycle and task dispatch

use crate::context::ContextRegistry;
use crate::error::{BoxError, RuntimeError, RuntimeResult, TaskFailure};
use crate::executor::{Envelope, EventLoop, Task, TaskQueue, WorkItem};
use crate::scheduler::Shared;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result delivered to a blocking task's continuation
pub type AsyncResult<T> = Result<T, TaskFailure>;

/// Failure sink of a context
pub type ExceptionHandler = Arc<dyn Fn(&TaskFailure) + Send + Sync + 'static>;

/// Unique identifier for a Context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Create a new unique context ID
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Kind of execution lane a context is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Pinned to one event loop thread
    EventLoop,
    /// Ordered lane on the worker pool
    Worker,
    /// Unordered submissions to the worker pool
    MultiThreadedWorker,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKind::EventLoop => f.write_str("event-loop"),
            ContextKind::Worker => f.write_str("worker"),
            ContextKind::MultiThreadedWorker => f.write_str("multi-threaded worker"),
        }
    }
}

/// What happens to queued tasks when a context or the runtime closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Run every queued task, then close
    #[default]
    Drain,
    /// Discard queued tasks and report each one as cancelled
    ForceStop,
}

/// Snapshot of a context's task counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Tasks accepted for execution
    pub submitted: u64,
    /// Tasks that ran to completion
    pub completed: u64,
    /// Tasks that panicked
    pub failed: u64,
    /// Tasks discarded before running
    pub cancelled: u64,
    /// Tasks accepted but not finished
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing(DrainPolicy),
    Closed,
}

/// Who is submitting a task; decides admission while the context closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Public submission, from any thread
    Caller,
    /// Runtime continuation, e.g. a blocking result posted back
    Internal,
    /// Last task of a closing context (deployment stop hook)
    Final,
}

/// Where an admitted task is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// The context's own queue
    Own,
    /// The worker pool, for a blocking body
    Blocking { ordered: bool },
}

enum Binding {
    EventLoop(Arc<EventLoop>),
    Worker(Arc<TaskQueue>),
    MultiThreaded,
}

struct State {
    lifecycle: Lifecycle,
    pending: usize,
    next_seq: u64,
    close_listeners: Vec<Box<dyn FnOnce() + Send + 'static>>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct ContextInner {
    id: ContextId,
    kind: ContextKind,
    binding: Binding,
    /// Lane serializing ordered blocking bodies of event loop and
    /// multi-threaded contexts; a worker context uses its own lane
    blocking_lane: Arc<TaskQueue>,
    shared: Arc<Shared>,
    state: Mutex<State>,
    closed: Condvar,
    /// Mirrors `Lifecycle::Closing(ForceStop)` for the lock-free check in `execute`
    force_stopped: AtomicBool,
    counters: Counters,
    exception_handler: RwLock<Option<ExceptionHandler>>,
    locals: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

/// Handle to an execution context
///
/// Cheap to clone; all clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Bind a new context of `kind` to the runtime's executors
    pub(crate) fn new(kind: ContextKind, shared: Arc<Shared>) -> Self {
        let binding = match kind {
            ContextKind::EventLoop => Binding::EventLoop(shared.event_loops.next_loop()),
            ContextKind::Worker => Binding::Worker(Arc::new(TaskQueue::new())),
            ContextKind::MultiThreadedWorker => Binding::MultiThreaded,
        };

        let context = Self {
            inner: Arc::new(ContextInner {
                id: ContextId::new(),
                kind,
                binding,
                blocking_lane: Arc::new(TaskQueue::new()),
                shared,
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Open,
                    pending: 0,
                    next_seq: 0,
                    close_listeners: Vec::new(),
                }),
                closed: Condvar::new(),
                force_stopped: AtomicBool::new(false),
                counters: Counters::default(),
                exception_handler: RwLock::new(None),
                locals: DashMap::new(),
            }),
        };

        tracing::debug!(
            context = %context.id(),
            kind = %kind,
            event_loop = ?context.event_loop_index(),
            "context created"
        );
        context
    }

    /// Context id
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Context kind
    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    /// Whether this context runs on an event loop
    pub fn is_event_loop_context(&self) -> bool {
        self.inner.kind == ContextKind::EventLoop
    }

    /// Whether this context runs on the worker pool (ordered or not)
    pub fn is_worker_context(&self) -> bool {
        !self.is_event_loop_context()
    }

    /// Index of the event loop this context is pinned to
    pub fn event_loop_index(&self) -> Option<usize> {
        match &self.inner.binding {
            Binding::EventLoop(event_loop) => Some(event_loop.index()),
            _ => None,
        }
    }

    /// Whether the calling thread is currently running a task of this context
    pub fn in_this_context(&self) -> bool {
        self.inner
            .shared
            .registry
            .current()
            .is_some_and(|current| current == *self)
    }

    /// Fail with [`RuntimeError::IllegalContextUse`] unless this is an event loop context.
    ///
    /// Components that need event loop affinity (servers, clients) call this
    /// before allocating anything.
    pub fn require_event_loop(&self, operation: &str) -> RuntimeResult<()> {
        if self.is_event_loop_context() {
            Ok(())
        } else {
            Err(RuntimeError::IllegalContextUse {
                operation: operation.to_string(),
                kind: self.kind(),
            })
        }
    }

    /// Queue a task on this context.
    ///
    /// Event loop and worker contexts run tasks one at a time in submission
    /// order; multi-threaded worker contexts give no ordering guarantee.
    pub fn run_on_context<F>(&self, task: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(task), Origin::Caller, Route::Own)
    }

    /// Run `blocking` on the worker pool and deliver its result to `handler` on this context.
    ///
    /// Blocking bodies of one context run in submission order. On a worker
    /// context they share the context's lane, so a body starts only after
    /// the task that submitted it has returned.
    pub fn execute_blocking<T, B, H>(&self, blocking: B, handler: H) -> RuntimeResult<()>
    where
        T: Send + 'static,
        B: FnOnce() -> Result<T, BoxError> + Send + 'static,
        H: FnOnce(AsyncResult<T>) + Send + 'static,
    {
        self.execute_blocking_with(true, blocking, handler)
    }

    /// Like [`execute_blocking`](Self::execute_blocking), with explicit ordering.
    ///
    /// With `ordered = false` bodies of the same context may run concurrently.
    pub fn execute_blocking_with<T, B, H>(
        &self,
        ordered: bool,
        blocking: B,
        handler: H,
    ) -> RuntimeResult<()>
    where
        T: Send + 'static,
        B: FnOnce() -> Result<T, BoxError> + Send + 'static,
        H: FnOnce(AsyncResult<T>) + Send + 'static,
    {
        let context = self.clone();
        let body: Task = Box::new(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(blocking)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskFailure::from(err)),
                Err(payload) => Err(TaskFailure::from_panic(payload)),
            };
            if let Err(err) = context.deliver_result(handler, result) {
                tracing::warn!(context = %context.id(), error = %err, "blocking result dropped");
                context.report_failure(TaskFailure::Cancelled);
            }
        });

        self.submit(body, Origin::Caller, Route::Blocking { ordered })
    }

    /// Post `result` to `handler` on this context.
    ///
    /// This is the single place where results computed elsewhere come back
    /// onto the context; it is accepted while the context drains.
    pub fn deliver_result<T, H>(&self, handler: H, result: AsyncResult<T>) -> RuntimeResult<()>
    where
        T: Send + 'static,
        H: FnOnce(AsyncResult<T>) + Send + 'static,
    {
        self.submit(Box::new(move || handler(result)), Origin::Internal, Route::Own)
    }

    /// Replace the failure sink of this context.
    ///
    /// Without a handler failures are logged.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        *self.inner.exception_handler.write() = Some(Arc::new(handler));
    }

    /// Store a context-local value
    pub fn put_local<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.locals.insert(key.into(), Arc::new(value));
    }

    /// Fetch a context-local value of type `T`
    pub fn get_local<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.locals.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    /// Remove a context-local value, returning whether it existed
    pub fn remove_local(&self, key: &str) -> bool {
        self.inner.locals.remove(key).is_some()
    }

    /// Task counters
    pub fn stats(&self) -> ContextStats {
        let counters = &self.inner.counters;
        ContextStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            pending: self.inner.state.lock().pending,
        }
    }

    /// Whether the context still accepts tasks from callers
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Open
    }

    /// Whether the context has finished closing
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Closed
    }

    /// Start closing the context.
    ///
    /// With [`DrainPolicy::Drain`] queued tasks still run, and tasks running
    /// on this context may keep queueing continuations; other callers are
    /// rejected. With [`DrainPolicy::ForceStop`] queued tasks are discarded.
    /// Closing twice is harmless; a drain can be escalated to a force stop.
    pub fn close(&self, policy: DrainPolicy) -> Closing {
        self.close_with(policy, None)
    }

    /// Close, running `final_task` as the last task of the context
    pub(crate) fn close_with(&self, policy: DrainPolicy, final_task: Option<Task>) -> Closing {
        let listeners = {
            let mut state = self.inner.state.lock();
            match state.lifecycle {
                Lifecycle::Closed => {}
                Lifecycle::Closing(DrainPolicy::ForceStop) => {}
                Lifecycle::Open | Lifecycle::Closing(DrainPolicy::Drain) => {
                    state.lifecycle = Lifecycle::Closing(policy);
                    if policy == DrainPolicy::ForceStop {
                        self.inner.force_stopped.store(true, Ordering::Release);
                    }
                    tracing::debug!(context = %self.id(), ?policy, pending = state.pending, "context closing");
                }
            }

            if let Some(task) = final_task {
                if let Err(err) = self.admit_and_route(&mut state, task, Origin::Final, Route::Own) {
                    tracing::warn!(context = %self.id(), error = %err, "final task rejected");
                }
            }

            self.try_finish_close(&mut state)
        };

        run_listeners(listeners);
        Closing {
            context: self.clone(),
        }
    }

    /// Run `listener` once the context has closed (immediately if it already has)
    pub fn on_closed<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            drop(state);
            listener();
        } else {
            state.close_listeners.push(Box::new(listener));
        }
    }

    // ========================================================================
    // Executor side
    // ========================================================================

    /// Run one task on the calling executor thread.
    ///
    /// The registry entry of this thread points at this context for the
    /// duration of the task and is restored afterwards, also on panic.
    pub(crate) fn execute(&self, registry: &ContextRegistry, seq: u64, force: bool, task: Task) {
        if !force && self.inner.force_stopped.load(Ordering::Acquire) {
            self.discard(seq);
            return;
        }

        {
            let _guard = registry.enter(self);
            match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(()) => {
                    self.inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let failure = TaskFailure::from_panic(payload);
                    tracing::debug!(context = %self.id(), seq, %failure, "task failed");
                    self.report_failure(failure);
                }
            }
        }

        self.finish_one();
    }

    /// Drop a queued task without running it
    pub(crate) fn discard(&self, seq: u64) {
        self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(context = %self.id(), seq, "task discarded");
        self.report_failure(TaskFailure::Cancelled);
        self.finish_one();
    }

    /// Hand a failure to the exception handler, or log it
    pub(crate) fn report_failure(&self, failure: TaskFailure) {
        let handler = self.inner.exception_handler.read().clone();
        match handler {
            Some(handler) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(&failure))).is_err() {
                    tracing::error!(context = %self.id(), %failure, "exception handler panicked");
                }
            }
            None if failure.is_cancelled() => {
                tracing::debug!(context = %self.id(), "task cancelled");
            }
            None => {
                tracing::error!(context = %self.id(), %failure, "unhandled task failure");
            }
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn submit(&self, task: Task, origin: Origin, route: Route) -> RuntimeResult<()> {
        // Evaluated before locking: the registry lookup may clone this context
        let own_thread = origin == Origin::Caller && self.in_this_context();
        let origin = if own_thread { Origin::Internal } else { origin };

        let mut state = self.inner.state.lock();
        self.admit_and_route(&mut state, task, origin, route)
    }

    /// Admission control and queueing, under the state lock so that the
    /// sequence numbers follow queue order.
    fn admit_and_route(
        &self,
        state: &mut State,
        task: Task,
        origin: Origin,
        route: Route,
    ) -> RuntimeResult<()> {
        let admitted = match (state.lifecycle, origin) {
            (Lifecycle::Open, _) => true,
            (Lifecycle::Closing(DrainPolicy::Drain), Origin::Internal | Origin::Final) => true,
            (Lifecycle::Closing(DrainPolicy::ForceStop), Origin::Final) => true,
            _ => false,
        };
        if !admitted {
            return Err(RuntimeError::ContextClosed(self.id()));
        }

        let seq = state.next_seq;
        let envelope = Envelope {
            context: self.clone(),
            seq,
            force: origin == Origin::Final,
            task,
        };

        let shared = &self.inner.shared;
        let routed = match (route, &self.inner.binding) {
            (Route::Own, Binding::EventLoop(event_loop)) => event_loop.submit(envelope),
            (Route::Own, Binding::Worker(lane)) => lane.push(envelope, &shared.worker_pool),
            (Route::Own, Binding::MultiThreaded) => {
                shared.worker_pool.submit(WorkItem::Task(envelope))
            }
            (Route::Blocking { ordered: true }, Binding::Worker(lane)) => {
                lane.push(envelope, &shared.worker_pool)
            }
            (Route::Blocking { ordered: true }, _) => {
                self.inner.blocking_lane.push(envelope, &shared.worker_pool)
            }
            (Route::Blocking { ordered: false }, _) => {
                shared.worker_pool.submit(WorkItem::Task(envelope))
            }
        };
        routed?;

        state.next_seq += 1;
        state.pending += 1;
        shared.inflight.increment();
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// One admitted task is done (run or discarded)
    fn finish_one(&self) {
        let listeners = {
            let mut state = self.inner.state.lock();
            state.pending = state.pending.saturating_sub(1);
            self.try_finish_close(&mut state)
        };
        run_listeners(listeners);
        self.inner.shared.inflight.decrement();
    }

    /// Move a closing context with no pending work to `Closed`
    fn try_finish_close(&self, state: &mut State) -> Vec<Box<dyn FnOnce() + Send + 'static>> {
        if matches!(state.lifecycle, Lifecycle::Closing(_)) && state.pending == 0 {
            state.lifecycle = Lifecycle::Closed;
            self.inner.closed.notify_all();
            tracing::debug!(context = %self.id(), "context closed");
            std::mem::take(&mut state.close_listeners)
        } else {
            Vec::new()
        }
    }
}

fn run_listeners(listeners: Vec<Box<dyn FnOnce() + Send + 'static>>) {
    for listener in listeners {
        listener();
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("event_loop", &self.event_loop_index())
            .finish()
    }
}

/// Handle on a context that has started closing
pub struct Closing {
    context: Context,
}

impl Closing {
    /// The context being closed
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Whether closing has completed
    pub fn is_closed(&self) -> bool {
        self.context.is_closed()
    }

    /// Block until the context has closed.
    ///
    /// Waiting from a task of the same context could never finish, so it is
    /// rejected.
    pub fn wait(&self, timeout: Duration) -> RuntimeResult<()> {
        if self.context.in_this_context() {
            return Err(RuntimeError::IllegalContextUse {
                operation: "Closing::wait".to_string(),
                kind: self.context.kind(),
            });
        }

        let inner = &self.context.inner;
        let deadline = Instant::now() + timeout;
        let mut state = inner.state.lock();
        while state.lifecycle != Lifecycle::Closed {
            if inner.closed.wait_until(&mut state, deadline).timed_out()
                && state.lifecycle != Lifecycle::Closed
            {
                return Err(RuntimeError::Timeout(format!("{} to close", self.context.id())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuntimeOptions, Scheduler};
    use crossbeam::channel;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn scheduler(event_loops: usize, workers: usize) -> Scheduler {
        let mut options = RuntimeOptions::with_pool_sizes(event_loops, workers);
        options.blocked_thread_check_enabled = false;
        Scheduler::new(options).unwrap()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_context_id_uniqueness() {
        let id1 = ContextId::new();
        let id2 = ContextId::new();
        let id3 = ContextId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_context_kind_predicates() {
        let scheduler = scheduler(2, 2);
        let el = scheduler.create_context(ContextKind::EventLoop);
        let worker = scheduler.create_context(ContextKind::Worker);
        let mt = scheduler.create_context(ContextKind::MultiThreadedWorker);

        assert!(el.is_event_loop_context());
        assert!(el.event_loop_index().is_some());
        assert!(worker.is_worker_context());
        assert!(worker.event_loop_index().is_none());
        assert!(mt.is_worker_context());

        assert!(el.require_event_loop("HttpServer").is_ok());
        assert!(matches!(
            worker.require_event_loop("HttpServer"),
            Err(RuntimeError::IllegalContextUse { kind: ContextKind::Worker, .. })
        ));
        assert!(matches!(
            mt.require_event_loop("NetClient"),
            Err(RuntimeError::IllegalContextUse { kind: ContextKind::MultiThreadedWorker, .. })
        ));
    }

    #[test]
    fn test_run_on_context_sets_current() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (tx, rx) = channel::bounded(1);

        let probe = scheduler.clone();
        ctx.run_on_context(move || {
            tx.send(probe.current_context()).unwrap();
        })
        .unwrap();

        let observed = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(observed, Some(ctx.clone()));
        assert!(!ctx.in_this_context());
    }

    #[test]
    fn test_failure_does_not_stop_context() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let failures = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::bounded(1);

        let seen = failures.clone();
        ctx.set_exception_handler(move |failure| {
            assert!(matches!(failure, TaskFailure::Panicked(_)));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        ctx.run_on_context(|| panic!("handler bug")).unwrap();
        ctx.run_on_context(move || tx.send("next task ran").unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "next task ran");
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        ctx.close(DrainPolicy::Drain).wait(WAIT).unwrap();
        let stats = ctx.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_locals() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::Worker);

        ctx.put_local("counter", 41u32);
        assert_eq!(ctx.get_local::<u32>("counter").as_deref(), Some(&41));
        assert!(ctx.get_local::<String>("counter").is_none());
        assert!(ctx.remove_local("counter"));
        assert!(!ctx.remove_local("counter"));
        assert!(ctx.get_local::<u32>("counter").is_none());
    }

    #[test]
    fn test_unused_context_closes_immediately() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::EventLoop);

        let closing = ctx.close(DrainPolicy::Drain);
        assert!(closing.is_closed());
        assert_eq!(ctx.stats(), ContextStats::default());

        // Closed contexts reject work
        assert!(matches!(
            ctx.run_on_context(|| {}),
            Err(RuntimeError::ContextClosed(id)) if id == ctx.id()
        ));
    }

    #[test]
    fn test_drain_runs_queued_tasks() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let ran = Arc::new(AtomicUsize::new(0));

        ctx.run_on_context(move || {
            let _ = gate_rx.recv_timeout(WAIT);
        })
        .unwrap();
        for _ in 0..3 {
            let ran = ran.clone();
            ctx.run_on_context(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let closing = ctx.close(DrainPolicy::Drain);
        assert!(!closing.is_closed());
        assert!(ctx.run_on_context(|| {}).is_err());

        gate_tx.send(()).unwrap();
        closing.wait(WAIT).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_force_stop_discards_queued_tasks() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let seen = cancelled.clone();
        ctx.set_exception_handler(move |failure| {
            if failure.is_cancelled() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        ctx.run_on_context(move || {
            started_tx.send(()).unwrap();
            let _ = gate_rx.recv_timeout(WAIT);
        })
        .unwrap();
        for _ in 0..4 {
            let ran = ran.clone();
            ctx.run_on_context(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        started_rx.recv_timeout(WAIT).unwrap();
        let closing = ctx.close(DrainPolicy::ForceStop);
        gate_tx.send(()).unwrap();
        closing.wait(WAIT).unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.stats().cancelled, 4);
    }

    #[test]
    fn test_wait_from_own_context_rejected() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (tx, rx) = channel::bounded(1);

        let inner = ctx.clone();
        ctx.run_on_context(move || {
            let closing = inner.close(DrainPolicy::Drain);
            tx.send(closing.wait(Duration::from_millis(10))).unwrap();
        })
        .unwrap();

        let result = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(result, Err(RuntimeError::IllegalContextUse { .. })));
        ctx.close(DrainPolicy::Drain).wait(WAIT).unwrap();
    }

    #[test]
    fn test_draining_context_accepts_own_continuations() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::Worker);
        let (tx, rx) = channel::unbounded();

        let inner = ctx.clone();
        ctx.run_on_context(move || {
            inner.close(DrainPolicy::Drain);
            let tx2 = tx.clone();
            inner.run_on_context(move || tx2.send("continuation").unwrap()).unwrap();
            tx.send("first").unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "first");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "continuation");
        ctx.close(DrainPolicy::Drain).wait(WAIT).unwrap();
    }

    #[test]
    fn test_on_closed_listener() {
        let scheduler = scheduler(1, 1);
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (tx, rx) = channel::bounded(2);

        let tx1 = tx.clone();
        ctx.on_closed(move || tx1.send("first").unwrap());
        ctx.close(DrainPolicy::Drain).wait(WAIT).unwrap();
        ctx.on_closed(move || tx.send("late").unwrap());

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "first");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "late");
    }

    #[test]
    fn test_multi_threaded_runs_concurrently() {
        let scheduler = scheduler(1, 4);
        let ctx = scheduler.create_context(ContextKind::MultiThreadedWorker);
        let barrier = Arc::new(std::sync::Barrier::new(3));
        let (tx, rx) = channel::unbounded();

        // Three tasks meeting at a barrier can only finish if they overlap
        for _ in 0..3 {
            let barrier = barrier.clone();
            let tx = tx.clone();
            ctx.run_on_context(move || {
                barrier.wait();
                tx.send(thread::current().id()).unwrap();
            })
            .unwrap();
        }

        let mut threads = Vec::new();
        for _ in 0..3 {
            threads.push(rx.recv_timeout(WAIT).unwrap());
        }
        threads.sort_by_key(|id| format!("{:?}", id));
        threads.dedup();
        assert_eq!(threads.len(), 3);
    }
}
