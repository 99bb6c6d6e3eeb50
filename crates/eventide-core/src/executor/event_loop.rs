//! Event loop threads
//!
//! Each event loop owns one thread and one FIFO channel. Every context
//! pinned to the loop shares that channel, so tasks of one context run in
//! the order they were queued and never concurrently.

use crate::context::{ContextRegistry, DrainPolicy};
use crate::error::{RuntimeError, RuntimeResult};
use crate::executor::{join_with_timeout, Envelope, ExecutorId, ThreadActivity};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A single-threaded executor
pub(crate) struct EventLoop {
    /// Slot index in the group
    index: usize,

    /// Queue sender; taken on shutdown so the loop drains and exits
    sender: RwLock<Option<Sender<Envelope>>>,

    /// Current task tracking (blocked-thread checker)
    activity: Arc<ThreadActivity>,

    /// Discard instead of run (force stop)
    discard: Arc<AtomicBool>,

    /// Thread handle
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawn the loop thread
    pub fn start(index: usize, prefix: &str, registry: ContextRegistry) -> std::io::Result<Arc<Self>> {
        let (tx, rx) = channel::unbounded::<Envelope>();
        let name = format!("{}-eventloop-{}", prefix, index);
        let activity = Arc::new(ThreadActivity::new(ExecutorId::EventLoop(index), name.clone()));
        let discard = Arc::new(AtomicBool::new(false));

        let thread_activity = activity.clone();
        let thread_discard = discard.clone();
        let handle = thread::Builder::new().name(name).spawn(move || {
            EventLoop::run_loop(rx, registry, thread_activity, thread_discard);
        })?;

        Ok(Arc::new(Self {
            index,
            sender: RwLock::new(Some(tx)),
            activity,
            discard,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Event loop main loop
    fn run_loop(
        rx: Receiver<Envelope>,
        registry: ContextRegistry,
        activity: Arc<ThreadActivity>,
        discard: Arc<AtomicBool>,
    ) {
        activity.bind_current_thread();

        // recv keeps returning queued envelopes after the sender is gone
        while let Ok(envelope) = rx.recv() {
            if discard.load(Ordering::Acquire) {
                envelope.cancel();
                continue;
            }

            activity.begin();
            envelope.run(&registry);
            activity.end();
        }

        tracing::debug!(executor = %activity.executor(), "event loop stopped");
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn activity(&self) -> &Arc<ThreadActivity> {
        &self.activity
    }

    /// Queue an envelope; fails once the loop is shutting down
    pub fn submit(&self, envelope: Envelope) -> RuntimeResult<()> {
        match self.sender.read().as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| RuntimeError::Shutdown),
            None => Err(RuntimeError::Shutdown),
        }
    }

    /// Stop accepting work and let the thread finish the queue.
    ///
    /// With `ForceStop`, queued envelopes are cancelled instead of run.
    pub fn stop(&self, policy: DrainPolicy) {
        if policy == DrainPolicy::ForceStop {
            self.discard.store(true, Ordering::Release);
        }
        self.sender.write().take();
    }

    /// Wait for the thread to exit
    pub fn join(&self, timeout: Duration) {
        if let Some(handle) = self.handle.lock().take() {
            join_with_timeout(handle, timeout);
        }
    }
}

/// Fixed set of event loops with round-robin assignment
pub(crate) struct EventLoopGroup {
    loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Start `size` event loops
    pub fn start(size: usize, prefix: &str, registry: &ContextRegistry) -> std::io::Result<Self> {
        let mut loops = Vec::with_capacity(size);
        for index in 0..size {
            match EventLoop::start(index, prefix, registry.clone()) {
                Ok(event_loop) => loops.push(event_loop),
                Err(err) => {
                    for started in &loops {
                        started.stop(DrainPolicy::Drain);
                        started.join(Duration::from_secs(1));
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// Next loop in round-robin order, whichever thread asks
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn loops(&self) -> &[Arc<EventLoop>] {
        &self.loops
    }

    /// Stop every loop, then join them
    pub fn shutdown(&self, policy: DrainPolicy, timeout: Duration) {
        for event_loop in &self.loops {
            event_loop.stop(policy);
        }
        for event_loop in &self.loops {
            event_loop.join(timeout);
        }
    }
}
