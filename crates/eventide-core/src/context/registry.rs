//! Thread to context association
//!
//! Each runtime owns one [`ContextRegistry`]. The active context of a thread
//! lives in thread-local storage keyed by the registry id, so several
//! runtimes can share a process (and even a thread) without observing each
//! other's contexts.

use crate::context::Context;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    static ACTIVE: RefCell<FxHashMap<u64, Context>> = RefCell::new(FxHashMap::default());
}

/// Handle to the per-thread active-context slots of one runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRegistry {
    id: u64,
}

impl ContextRegistry {
    /// Create a registry with a fresh id
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Registry id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Context active on the calling thread, if any
    pub fn current(&self) -> Option<Context> {
        ACTIVE
            .try_with(|active| active.borrow().get(&self.id).cloned())
            .ok()
            .flatten()
    }

    /// Make `context` the active context of the calling thread.
    ///
    /// The previous value is restored when the guard drops, which keeps
    /// nested execution (a task running another context's task inline)
    /// consistent.
    pub(crate) fn enter(&self, context: &Context) -> RegistryGuard<'_> {
        let previous = ACTIVE
            .try_with(|active| active.borrow_mut().insert(self.id, context.clone()))
            .ok()
            .flatten();

        RegistryGuard {
            registry: self,
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the previous active context on drop
///
/// Bound to the thread that created it.
pub(crate) struct RegistryGuard<'a> {
    registry: &'a ContextRegistry,
    previous: Option<Context>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        let id = self.registry.id;
        let previous = self.previous.take();
        // Displaced context is dropped after the borrow ends
        let _displaced = ACTIVE
            .try_with(|active| {
                let mut active = active.borrow_mut();
                match previous {
                    Some(context) => active.insert(id, context),
                    None => active.remove(&id),
                }
            })
            .ok()
            .flatten();
    }
}
