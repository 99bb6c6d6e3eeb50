//! Bounded worker pool for blocking work

use crate::context::{ContextRegistry, DrainPolicy};
use crate::error::{RuntimeError, RuntimeResult};
use crate::executor::{join_with_timeout, Envelope, ExecutorId, TaskQueue, ThreadActivity};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Work sent to the worker threads
pub(crate) enum WorkItem {
    /// Unordered task
    Task(Envelope),
    /// Turn of an ordered lane
    Lane(Arc<TaskQueue>),
}

/// State shared by the pool handle and its threads
struct PoolShared {
    /// Queue sender; taken on shutdown
    sender: RwLock<Option<Sender<WorkItem>>>,
    /// Discard instead of run (force stop)
    discard: AtomicBool,
    /// Work items queued but not yet picked up
    queued: AtomicUsize,
    registry: ContextRegistry,
}

impl PoolShared {
    fn submit(&self, item: WorkItem) -> RuntimeResult<()> {
        let sender = self.sender.read();
        let tx = sender.as_ref().ok_or(RuntimeError::Shutdown)?;
        self.queued.fetch_add(1, Ordering::Relaxed);
        tx.send(item).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            RuntimeError::Shutdown
        })
    }

    fn run(&self, envelope: Envelope, activity: &ThreadActivity) {
        if self.discard.load(Ordering::Acquire) {
            envelope.cancel();
            return;
        }
        activity.begin();
        envelope.run(&self.registry);
        activity.end();
    }
}

/// Fixed-size pool of worker threads
///
/// Never grows: when every worker is busy, work waits in the queue.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    activities: Vec<Arc<ThreadActivity>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `size` worker threads
    pub fn start(size: usize, prefix: &str, registry: &ContextRegistry) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<WorkItem>();
        let shared = Arc::new(PoolShared {
            sender: RwLock::new(Some(tx)),
            discard: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            registry: registry.clone(),
        });

        let pool = Self {
            shared,
            activities: Vec::with_capacity(size),
            handles: Mutex::new(Vec::with_capacity(size)),
        };
        pool.spawn_workers(size, prefix, rx)
    }

    fn spawn_workers(mut self, size: usize, prefix: &str, rx: Receiver<WorkItem>) -> std::io::Result<Self> {
        for index in 0..size {
            let name = format!("{}-worker-{}", prefix, index);
            let activity = Arc::new(ThreadActivity::new(ExecutorId::Worker(index), name.clone()));

            let thread_rx = rx.clone();
            let thread_shared = self.shared.clone();
            let thread_activity = activity.clone();
            let spawned = thread::Builder::new().name(name).spawn(move || {
                WorkerPool::worker_loop(thread_rx, thread_shared, thread_activity);
            });

            match spawned {
                Ok(handle) => {
                    self.activities.push(activity);
                    self.handles.get_mut().push(handle);
                }
                Err(err) => {
                    self.shutdown(DrainPolicy::Drain, Duration::from_secs(1));
                    return Err(err);
                }
            }
        }
        Ok(self)
    }

    /// Worker thread main loop
    fn worker_loop(rx: Receiver<WorkItem>, shared: Arc<PoolShared>, activity: Arc<ThreadActivity>) {
        activity.bind_current_thread();

        while let Ok(item) = rx.recv() {
            shared.queued.fetch_sub(1, Ordering::Relaxed);

            match item {
                WorkItem::Task(envelope) => shared.run(envelope, &activity),
                WorkItem::Lane(lane) => {
                    let Some(envelope) = lane.take_next() else {
                        continue;
                    };
                    shared.run(envelope, &activity);

                    if lane.finish_turn() && shared.submit(WorkItem::Lane(lane.clone())).is_err() {
                        // Pool is closing: finish the lane here, still in order
                        while let Some(envelope) = lane.take_next() {
                            shared.run(envelope, &activity);
                        }
                    }
                }
            }
        }

        tracing::debug!(executor = %activity.executor(), "worker stopped");
    }

    /// Queue a work item
    pub fn submit(&self, item: WorkItem) -> RuntimeResult<()> {
        self.shared.submit(item)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Work items waiting for a free worker
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Relaxed)
    }

    pub fn activities(&self) -> &[Arc<ThreadActivity>] {
        &self.activities
    }

    /// Stop accepting work, finish or discard the queue, join the threads
    pub fn shutdown(&self, policy: DrainPolicy, timeout: Duration) {
        if policy == DrainPolicy::ForceStop {
            self.shared.discard.store(true, Ordering::Release);
        }
        self.shared.sender.write().take();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            join_with_timeout(handle, timeout);
        }
    }
}
