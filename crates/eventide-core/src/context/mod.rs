//! Execution contexts
//!
//! A context controls the scope and order in which a set of tasks runs.
//! Every context is bound to one execution lane for its whole lifetime:
//! an event loop thread, an ordered worker lane, or the unordered worker pool.

#[allow(clippy::module_inception)]
mod context;
mod registry;

pub use context::{
    AsyncResult, Closing, Context, ContextId, ContextKind, ContextStats, DrainPolicy,
    ExceptionHandler,
};
pub use registry::ContextRegistry;
