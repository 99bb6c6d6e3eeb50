//! Task envelopes queued on executors

use crate::context::{Context, ContextRegistry};

/// A unit of work submitted to a context
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A task together with the context it belongs to
pub(crate) struct Envelope {
    /// Owning context
    pub context: Context,
    /// Per-context sequence number, in queue order
    pub seq: u64,
    /// Runs even if the context was force-stopped
    pub force: bool,
    /// The work itself
    pub task: Task,
}

impl Envelope {
    /// Execute on the calling executor thread
    pub fn run(self, registry: &ContextRegistry) {
        let Envelope {
            context,
            seq,
            force,
            task,
        } = self;
        context.execute(registry, seq, force, task);
    }

    /// Drop without running, reporting the cancellation to the context
    pub fn cancel(self) {
        self.context.discard(self.seq);
    }
}
