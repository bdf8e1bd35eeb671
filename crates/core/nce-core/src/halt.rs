//! Halt reasons reported by the execution engine.
//!
//! Producers (fault handlers, interrupt requesters) OR bits into a
//! [`HaltReasonCell`]; the run loop is the only consumer and swaps it back to
//! zero. Bits set between two swaps are never lost.

use bitflags::bitflags;

use crate::sync::{AtomicU64, Ordering};

bitflags! {
    /// Why guest execution returned control to the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HaltReason: u64 {
        /// A single step completed.
        const STEP_THREAD = 1 << 0;
        /// A data abort could not be resolved.
        const DATA_ABORT = 1 << 1;
        /// Another thread asked the run loop to stop.
        const BREAK_LOOP = 1 << 2;
        /// The guest issued a supervisor call.
        const SUPERVISOR_CALL = 1 << 3;
        /// The guest hit an instruction breakpoint.
        const INSTRUCTION_BREAKPOINT = 1 << 4;
        /// An instruction fetch faulted and could not be resolved.
        const PREFETCH_ABORT = 1 << 6;
    }
}

impl HaltReason {
    /// Converts the raw value returned by the trap transition.
    ///
    /// Unknown bits are kept so that nothing a producer raised is dropped.
    pub const fn from_raw(bits: u64) -> Self {
        Self::from_bits_retain(bits)
    }
}

/// Atomic accumulator for [`HaltReason`] bits.
pub struct HaltReasonCell {
    bits: AtomicU64,
}

impl HaltReasonCell {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    /// ORs `reason` into the cell and returns the previous value.
    pub fn raise(&self, reason: HaltReason) -> HaltReason {
        HaltReason::from_raw(self.bits.fetch_or(reason.bits(), Ordering::SeqCst))
    }

    /// Atomically exchanges the accumulated bits for zero.
    pub fn take(&self) -> HaltReason {
        HaltReason::from_raw(self.bits.swap(0, Ordering::SeqCst))
    }

    /// Reads the accumulated bits without consuming them.
    pub fn peek(&self) -> HaltReason {
        HaltReason::from_raw(self.bits.load(Ordering::SeqCst))
    }

    pub fn is_pending(&self) -> bool {
        !self.peek().is_empty()
    }
}

impl Default for HaltReasonCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HaltReasonCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HaltReasonCell").field(&self.peek()).finish()
    }
}
