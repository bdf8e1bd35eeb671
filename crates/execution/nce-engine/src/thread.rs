//! Guest thread abstraction consumed by the execution engine.

use std::collections::HashMap;
use std::sync::Arc;

use nce_core::ControlBlock;
use parking_lot::RwLock;

/// A schedulable guest thread.
///
/// The control block is published to the trap glue through `tpidr_el0`, so it
/// must stay at the same address while the thread is bound to an engine.
pub trait GuestThread: Send + Sync {
    fn control_block(&self) -> &ControlBlock;

    /// Fast re-entry trampoline registered for guest `pc`, if any.
    fn post_handler(&self, pc: u64) -> Option<u64>;
}

/// Process-wide map from guest return addresses to re-entry trampolines.
#[derive(Debug, Clone, Default)]
pub struct PostHandlerTable {
    handlers: Arc<RwLock<HashMap<u64, u64>>>,
}

impl PostHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trampoline previously registered for `pc`.
    pub fn register(&self, pc: u64, trampoline: u64) -> Option<u64> {
        self.handlers.write().insert(pc, trampoline)
    }

    pub fn unregister(&self, pc: u64) -> Option<u64> {
        self.handlers.write().remove(&pc)
    }

    pub fn lookup(&self, pc: u64) -> Option<u64> {
        self.handlers.read().get(&pc).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// Control block paired with its process's post-handler table.
#[derive(Debug, Default)]
pub struct GuestThreadState {
    control: ControlBlock,
    post_handlers: PostHandlerTable,
}

impl GuestThreadState {
    pub fn new(post_handlers: PostHandlerTable) -> Self {
        Self {
            control: ControlBlock::new(),
            post_handlers,
        }
    }

    pub fn post_handlers(&self) -> &PostHandlerTable {
        &self.post_handlers
    }
}

impl GuestThread for GuestThreadState {
    fn control_block(&self) -> &ControlBlock {
        &self.control
    }

    fn post_handler(&self, pc: u64) -> Option<u64> {
        self.post_handlers.lookup(pc)
    }
}
