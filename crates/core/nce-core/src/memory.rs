//! Interface to the guest memory manager.

use std::ptr::NonNull;

/// Guest page size used by the translation cache and fault handling.
pub const GUEST_PAGE_SIZE: u64 = 4096;

/// Memory manager consumed by the fault dispatcher.
///
/// Implementations are shared between the execution thread (fault handling,
/// possibly inside a signal handler) and the rest of the emulator, hence
/// `Send + Sync`.
pub trait GuestMemory: Send + Sync {
    /// Re-validates the native mapping of `[addr, addr + size)`. Returns true
    /// when the range is now accessible.
    fn invalidate_nce(&self, addr: u64, size: u64) -> bool;

    /// Host address backing `addr`, if it is mapped.
    fn get_pointer(&self, addr: u64) -> Option<NonNull<u8>>;

    /// Rebuilds the mapping of `[addr, addr + size)`.
    fn remap(&self, addr: u64, size: u64) -> bool;

    /// Copies guest memory into `buf`. Returns false if any byte is unmapped.
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool;

    /// Copies `data` into guest memory. Returns false if any byte is unmapped.
    fn write(&self, addr: u64, data: &[u8]) -> bool;

    /// Whether new translations for `addr` should be marked writable.
    fn is_writable(&self, _addr: u64) -> bool {
        true
    }
}

