//! Ordered lanes on the worker pool
//!
//! A lane is scheduled on the pool as a single work item. Whichever worker
//! picks it up runs the head task and hands the lane back to the pool if
//! more tasks are waiting, so a lane never has two tasks in flight while
//! different lanes still share the workers fairly.

use crate::error::RuntimeResult;
use crate::executor::{Envelope, WorkItem, WorkerPool};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct LaneState {
    tasks: VecDeque<Envelope>,
    /// A work item for this lane is queued on, or running in, the pool
    scheduled: bool,
}

/// FIFO lane executed one task at a time on the worker pool
pub(crate) struct TaskQueue {
    state: Mutex<LaneState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LaneState {
                tasks: VecDeque::new(),
                scheduled: false,
            }),
        }
    }

    /// Append a task, scheduling the lane if it is idle
    pub fn push(self: &Arc<Self>, envelope: Envelope, pool: &WorkerPool) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.tasks.push_back(envelope);
        if state.scheduled {
            return Ok(());
        }

        state.scheduled = true;
        if let Err(err) = pool.submit(WorkItem::Lane(self.clone())) {
            state.tasks.pop_back();
            state.scheduled = false;
            return Err(err);
        }
        Ok(())
    }

    /// Take the head task; an empty lane becomes idle
    pub fn take_next(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        let next = state.tasks.pop_front();
        if next.is_none() {
            state.scheduled = false;
        }
        next
    }

    /// End a turn. Returns true if the lane must be scheduled again.
    pub fn finish_turn(&self) -> bool {
        let mut state = self.state.lock();
        if state.tasks.is_empty() {
            state.scheduled = false;
            false
        } else {
            true
        }
    }
}
