//! Runtime handle and shared executor state

use crate::config::RuntimeOptions;
use crate::context::{Context, ContextKind, ContextRegistry, DrainPolicy};
use crate::deployment::{Deployable, DeploymentId, DeploymentManager, DeploymentOptions};
use crate::error::RuntimeResult;
use crate::executor::{EventLoopGroup, ExecutorProbe, ThreadActivity, WorkerPool};
use crate::scheduler::checker::{BlockedThreadChecker, BlockedThreadListener, Thresholds};
use crate::scheduler::timer::{TimerId, TimerService};
use crate::sync::PendingCounter;
use crate::AsyncResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Contexts created since start
    pub contexts_created: u64,

    /// Number of event loop threads
    pub event_loops: usize,

    /// Number of worker threads
    pub workers: usize,

    /// Tasks accepted by any context and not yet finished
    pub inflight_tasks: usize,

    /// Work items waiting for a free worker
    pub queued_worker_items: usize,

    /// Timers not yet fired or cancelled
    pub active_timers: usize,

    /// Live deployments
    pub deployments: usize,
}

/// State every context of a runtime points at
pub(crate) struct Shared {
    pub options: RuntimeOptions,
    pub registry: ContextRegistry,
    pub event_loops: EventLoopGroup,
    pub worker_pool: WorkerPool,
    /// Tasks accepted by any context and not yet finished
    pub inflight: PendingCounter,
    pub contexts_created: AtomicU64,
}

impl Shared {
    /// Create a context bound to this runtime's executors
    pub fn create_context(self: &Arc<Self>, kind: ContextKind) -> Context {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        Context::new(kind, self.clone())
    }

    /// Current context of the calling thread, or a new event loop context
    pub fn get_or_create_context(self: &Arc<Self>) -> Context {
        match self.registry.current() {
            Some(context) => context,
            None => self.create_context(ContextKind::EventLoop),
        }
    }

    /// Whether the calling thread is one of this runtime's executors
    fn on_executor_thread(&self) -> bool {
        self.activities().iter().any(|activity| activity.is_current_thread())
    }

    fn activities(&self) -> Vec<Arc<ThreadActivity>> {
        self.event_loops
            .loops()
            .iter()
            .map(|event_loop| event_loop.activity().clone())
            .chain(self.worker_pool.activities().iter().cloned())
            .collect()
    }
}

struct SchedulerInner {
    shared: Arc<Shared>,
    timers: TimerService,
    checker: Mutex<Option<BlockedThreadChecker>>,
    deployments: DeploymentManager,
    closed: AtomicBool,
}

/// Runtime handle
///
/// Cheap to clone. The runtime shuts down with [`DrainPolicy::Drain`] when
/// the last clone is dropped, unless [`close`](Scheduler::close) ran first.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Start a runtime: event loops, workers, timer thread and, if enabled,
    /// the blocked-thread checker
    pub fn new(options: RuntimeOptions) -> RuntimeResult<Self> {
        Self::build(options, None)
    }

    /// Like [`new`](Self::new), delivering blocked-thread reports to `listener`
    pub fn with_blocked_thread_listener<F>(options: RuntimeOptions, listener: F) -> RuntimeResult<Self>
    where
        F: Fn(&crate::BlockedThreadReport) + Send + Sync + 'static,
    {
        let listener: BlockedThreadListener = Arc::new(listener);
        Self::build(options, Some(listener))
    }

    fn build(options: RuntimeOptions, listener: Option<BlockedThreadListener>) -> RuntimeResult<Self> {
        options.validate()?;
        let prefix = options.thread_name_prefix.clone();
        let timeout = options.shutdown_timeout();
        let registry = ContextRegistry::new();

        let event_loops = EventLoopGroup::start(options.event_loop_pool_size, &prefix, &registry)?;
        let worker_pool = match WorkerPool::start(options.worker_pool_size, &prefix, &registry) {
            Ok(pool) => pool,
            Err(err) => {
                event_loops.shutdown(DrainPolicy::Drain, timeout);
                return Err(err.into());
            }
        };

        let shared = Arc::new(Shared {
            options,
            registry,
            event_loops,
            worker_pool,
            inflight: PendingCounter::new(),
            contexts_created: AtomicU64::new(0),
        });

        let stop_executors = |shared: &Shared| {
            shared.event_loops.shutdown(DrainPolicy::Drain, timeout);
            shared.worker_pool.shutdown(DrainPolicy::Drain, timeout);
        };

        let timers = match TimerService::start(&prefix) {
            Ok(timers) => timers,
            Err(err) => {
                stop_executors(&shared);
                return Err(err.into());
            }
        };

        let checker = if shared.options.blocked_thread_check_enabled {
            let thresholds = Thresholds {
                event_loop: shared.options.max_event_loop_execute_time(),
                worker: shared.options.max_worker_execute_time(),
            };
            match BlockedThreadChecker::start(
                &prefix,
                shared.activities(),
                thresholds,
                shared.options.blocked_thread_check_interval(),
                listener,
            ) {
                Ok(checker) => Some(checker),
                Err(err) => {
                    timers.stop(timeout);
                    stop_executors(&shared);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        tracing::info!(
            registry = shared.registry.id(),
            event_loops = shared.event_loops.len(),
            workers = shared.worker_pool.len(),
            "scheduler started"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                shared,
                timers,
                checker: Mutex::new(checker),
                deployments: DeploymentManager::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Options the runtime was started with
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.shared.options
    }

    /// Registry answering which context runs on a thread
    pub fn registry(&self) -> &ContextRegistry {
        &self.inner.shared.registry
    }

    /// Create a new context.
    ///
    /// Event loop contexts are pinned to loops in round-robin order, no
    /// matter which thread asks.
    pub fn create_context(&self, kind: ContextKind) -> Context {
        self.inner.shared.create_context(kind)
    }

    /// Context whose task is running on the calling thread
    pub fn current_context(&self) -> Option<Context> {
        self.inner.shared.registry.current()
    }

    /// Current context, or a new event loop context.
    ///
    /// The calling thread is not bound to a context it creates: a second
    /// call from the same foreign thread creates another one.
    pub fn get_or_create_context(&self) -> Context {
        self.inner.shared.get_or_create_context()
    }

    /// Run `task` on [`get_or_create_context`](Self::get_or_create_context)
    pub fn run_on_context<F>(&self, task: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.get_or_create_context().run_on_context(task)
    }

    /// Context for an operation that needs event loop affinity.
    ///
    /// Fails with [`IllegalContextUse`](crate::RuntimeError::IllegalContextUse) when called from a
    /// worker context; a foreign thread gets a new event loop context.
    pub fn require_event_loop_context(&self, operation: &str) -> RuntimeResult<Context> {
        let context = self.get_or_create_context();
        context.require_event_loop(operation)?;
        Ok(context)
    }

    /// Snapshot of every executor thread
    pub fn probe_executors(&self) -> Vec<ExecutorProbe> {
        let now = Instant::now();
        self.inner
            .shared
            .activities()
            .iter()
            .map(|activity| activity.probe(now))
            .collect()
    }

    /// Number of event loop threads
    pub fn event_loop_count(&self) -> usize {
        self.inner.shared.event_loops.len()
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.inner.shared.worker_pool.len()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let shared = &self.inner.shared;
        SchedulerStats {
            contexts_created: shared.contexts_created.load(Ordering::Relaxed),
            event_loops: shared.event_loops.len(),
            workers: shared.worker_pool.len(),
            inflight_tasks: shared.inflight.get(),
            queued_worker_items: shared.worker_pool.queued(),
            active_timers: self.inner.timers.active_count(),
            deployments: self.inner.deployments.len(),
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Run `handler` once after `delay` on the current (or a new) context
    pub fn set_timer<F>(&self, delay: Duration, handler: F) -> TimerId
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let context = self.get_or_create_context();
        self.set_timer_on(&context, delay, handler)
    }

    /// Run `handler` once after `delay` on `context`
    pub fn set_timer_on<F>(&self, context: &Context, delay: Duration, handler: F) -> TimerId
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        self.inner.timers.schedule_once(context, delay, handler)
    }

    /// Run `handler` every `period` on the current (or a new) context
    pub fn set_periodic<F>(&self, period: Duration, handler: F) -> TimerId
    where
        F: Fn(TimerId) + Send + Sync + 'static,
    {
        let context = self.get_or_create_context();
        self.set_periodic_on(&context, period, handler)
    }

    /// Run `handler` every `period` on `context`.
    ///
    /// Delays and periods under one millisecond are raised to one millisecond.
    pub fn set_periodic_on<F>(&self, context: &Context, period: Duration, handler: F) -> TimerId
    where
        F: Fn(TimerId) + Send + Sync + 'static,
    {
        self.inner.timers.schedule_periodic(context, period, handler)
    }

    /// Cancel a timer; false if it already fired or was cancelled
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.timers.cancel(id)
    }

    // ========================================================================
    // Deployments
    // ========================================================================

    /// Deploy `options.instances` instances built by `factory`, each on its own
    /// new context.
    ///
    /// `on_complete` runs on the caller's context once every instance has
    /// started, or once a failed deployment has been rolled back.
    pub fn deploy<D, F, H>(&self, factory: F, options: DeploymentOptions, on_complete: H) -> RuntimeResult<()>
    where
        D: Deployable,
        F: Fn() -> D,
        H: FnOnce(AsyncResult<DeploymentId>) + Send + 'static,
    {
        let caller = self.get_or_create_context();
        self.inner
            .deployments
            .deploy(&self.inner.shared, caller, factory, options, on_complete)
    }

    /// Stop every instance of a deployment and close its contexts with `policy`.
    ///
    /// `on_complete` runs on the caller's context once all contexts closed.
    pub fn undeploy<H>(&self, id: DeploymentId, policy: DrainPolicy, on_complete: H) -> RuntimeResult<()>
    where
        H: FnOnce(AsyncResult<()>) + Send + 'static,
    {
        let caller = self.get_or_create_context();
        self.inner.deployments.undeploy(id, policy, caller, on_complete)
    }

    /// Ids of live deployments
    pub fn deployment_ids(&self) -> Vec<DeploymentId> {
        self.inner.deployments.ids()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut the runtime down.
    ///
    /// Live deployments are undeployed with `policy`. Under
    /// [`DrainPolicy::Drain`] in-flight tasks get up to the shutdown timeout
    /// to finish; then timers, the checker and all executor threads stop.
    /// Calling it again is a no-op.
    pub fn close(&self, policy: DrainPolicy) {
        self.inner.close(policy);
    }
}

impl SchedulerInner {
    fn close(&self, policy: DrainPolicy) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = &self.shared;
        let timeout = shared.options.shutdown_timeout();
        tracing::info!(registry = shared.registry.id(), ?policy, "scheduler closing");

        self.deployments.undeploy_all(policy);

        if policy == DrainPolicy::Drain {
            if shared.registry.current().is_some() || shared.on_executor_thread() {
                // The calling task itself is in flight
                tracing::debug!("scheduler closed from one of its own tasks, not waiting for in-flight work");
            } else if !shared.inflight.wait_idle(timeout) {
                tracing::warn!(
                    inflight = shared.inflight.get(),
                    timeout_ms = timeout.as_millis() as u64,
                    "in-flight tasks did not finish before shutdown timeout"
                );
            }
        }

        self.timers.stop(timeout);
        if let Some(mut checker) = self.checker.lock().take() {
            checker.stop(timeout);
        }
        shared.event_loops.shutdown(policy, timeout);
        shared.worker_pool.shutdown(policy, timeout);

        tracing::info!(registry = shared.registry.id(), "scheduler closed");
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.close(DrainPolicy::Drain);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.inner.shared.registry.id())
            .field("event_loops", &self.event_loop_count())
            .field("workers", &self.worker_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeError;
    use crossbeam::channel;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    fn options(event_loops: usize, workers: usize) -> RuntimeOptions {
        let mut options = RuntimeOptions::with_pool_sizes(event_loops, workers);
        options.blocked_thread_check_enabled = false;
        options
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(options(3, 5)).unwrap();
        assert_eq!(scheduler.event_loop_count(), 3);
        assert_eq!(scheduler.worker_count(), 5);
        assert!(!scheduler.is_closed());

        let stats = scheduler.stats();
        assert_eq!(stats.event_loops, 3);
        assert_eq!(stats.workers, 5);
        assert_eq!(stats.contexts_created, 0);
        assert_eq!(stats.inflight_tasks, 0);
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(matches!(
            Scheduler::new(RuntimeOptions::with_pool_sizes(0, 1)),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_current_context_outside_tasks() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        assert!(scheduler.current_context().is_none());

        // Only executor threads are ever bound, and only while a task runs
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (tx, rx) = channel::bounded(1);
        let registry = scheduler.registry().clone();
        ctx.run_on_context(move || tx.send(registry.current().is_some()).unwrap())
            .unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap());

        assert!(scheduler.current_context().is_none());
        assert!(scheduler.registry().current().is_none());
    }

    #[test]
    fn test_get_or_create_from_foreign_thread() {
        let scheduler = Scheduler::new(options(2, 1)).unwrap();

        let first = scheduler.get_or_create_context();
        let second = scheduler.get_or_create_context();
        assert!(first.is_event_loop_context());
        assert_ne!(first, second);
        assert!(scheduler.current_context().is_none());
        assert_eq!(scheduler.stats().contexts_created, 2);
    }

    #[test]
    fn test_get_or_create_inside_task_returns_current() {
        let scheduler = Scheduler::new(options(1, 2)).unwrap();
        let ctx = scheduler.create_context(ContextKind::Worker);
        let (tx, rx) = channel::bounded(1);

        let probe = scheduler.clone();
        ctx.run_on_context(move || tx.send(probe.get_or_create_context()).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ctx);
    }

    #[test]
    fn test_require_event_loop_context() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        assert!(scheduler.require_event_loop_context("NetServer").is_ok());

        let worker = scheduler.create_context(ContextKind::Worker);
        let (tx, rx) = channel::bounded(1);
        let probe = scheduler.clone();
        worker
            .run_on_context(move || tx.send(probe.require_event_loop_context("NetServer").map(|_| ())).unwrap())
            .unwrap();

        match rx.recv_timeout(WAIT).unwrap() {
            Err(RuntimeError::IllegalContextUse { operation, kind }) => {
                assert_eq!(operation, "NetServer");
                assert_eq!(kind, ContextKind::Worker);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_probe_executors() {
        let scheduler = Scheduler::new(options(2, 3)).unwrap();
        let probes = scheduler.probe_executors();
        assert_eq!(probes.len(), 5);
        assert_eq!(probes[0].thread_name, "eventide-eventloop-0");
        assert_eq!(probes[4].thread_name, "eventide-worker-2");
        assert!(probes.iter().all(|probe| probe.current_task_elapsed.is_none()));
    }

    #[test]
    fn test_probe_sees_running_task() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (started_tx, started_rx) = channel::bounded(1);
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);

        ctx.run_on_context(move || {
            started_tx.send(()).unwrap();
            let _ = gate_rx.recv_timeout(WAIT);
        })
        .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        thread::sleep(Duration::from_millis(20));

        let probe = &scheduler.probe_executors()[0];
        assert!(probe.current_task_elapsed_ms().unwrap_or(0) >= 20);
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn test_close_drains_inflight_work() {
        let scheduler = Scheduler::new(options(2, 2)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let ctx = scheduler.create_context(ContextKind::EventLoop);
            let ran = ran.clone();
            ctx.run_on_context(move || {
                thread::sleep(Duration::from_millis(2));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        scheduler.close(DrainPolicy::Drain);
        assert!(scheduler.is_closed());
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(scheduler.stats().inflight_tasks, 0);

        // Second close is a no-op
        scheduler.close(DrainPolicy::ForceStop);
    }

    #[test]
    fn test_close_from_own_task_does_not_hang() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (tx, rx) = channel::bounded(1);

        let inner = scheduler.clone();
        ctx.run_on_context(move || {
            inner.close(DrainPolicy::Drain);
            tx.send(inner.is_closed()).unwrap();
        })
        .unwrap();

        assert!(rx.recv_timeout(WAIT).unwrap());
    }

    #[test]
    fn test_timer_fires_on_context() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (tx, rx) = channel::bounded(1);

        let probe = scheduler.clone();
        let id = scheduler.set_timer_on(&ctx, Duration::from_millis(10), move |fired| {
            tx.send((fired, probe.current_context())).unwrap();
        });

        let (fired, current) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(fired, id);
        assert_eq!(current, Some(ctx));
        assert!(!scheduler.cancel_timer(id));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        let id = scheduler.set_timer(Duration::from_millis(30), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.stats().active_timers, 1);
        assert!(scheduler.cancel_timer(id));
        assert_eq!(scheduler.stats().active_timers, 0);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_periodic_timer_until_cancelled() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        let ctx = scheduler.create_context(ContextKind::Worker);
        let (tx, rx) = channel::unbounded();

        let id = scheduler.set_periodic_on(&ctx, Duration::from_millis(5), move |id| {
            let _ = tx.send(id);
        });

        for _ in 0..3 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), id);
        }
        assert!(scheduler.cancel_timer(id));
        assert!(!scheduler.cancel_timer(id));
    }

    #[test]
    fn test_zero_period_does_not_flood_busy_context() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        ctx.run_on_context(move || {
            let _ = gate_rx.recv_timeout(WAIT);
        })
        .unwrap();

        let id = scheduler.set_periodic_on(&ctx, Duration::ZERO, |_| {});
        thread::sleep(Duration::from_millis(100));

        // At most one firing per millisecond while the loop is held
        let pending = ctx.stats().pending;
        assert!(pending <= 500, "pending firings: {}", pending);

        assert!(scheduler.cancel_timer(id));
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn test_timer_of_closed_context_dropped() {
        let scheduler = Scheduler::new(options(1, 1)).unwrap();
        let ctx = scheduler.create_context(ContextKind::EventLoop);
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        scheduler.set_periodic_on(&ctx, Duration::from_millis(50), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        ctx.close(DrainPolicy::Drain).wait(WAIT).unwrap();

        // The next firing is rejected and the timer removed
        let deadline = Instant::now() + WAIT;
        while scheduler.stats().active_timers > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(scheduler.stats().active_timers, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blocked_thread_listener() {
        let mut options = options(1, 1);
        options.blocked_thread_check_enabled = true;
        options.blocked_thread_check_interval_ms = 5;
        options.max_event_loop_execute_time_ms = 10;

        let (report_tx, report_rx) = channel::unbounded();
        let scheduler = Scheduler::with_blocked_thread_listener(options, move |report| {
            let _ = report_tx.send(report.clone());
        })
        .unwrap();

        let ctx = scheduler.create_context(ContextKind::EventLoop);
        ctx.run_on_context(|| thread::sleep(Duration::from_millis(100)))
            .unwrap();

        let report = report_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(report.executor, crate::ExecutorId::EventLoop(0));
        assert_eq!(report.threshold, Duration::from_millis(10));
        assert!(report.elapsed > report.threshold);
    }
}
