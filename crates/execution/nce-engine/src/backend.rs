//! Trap backends.
//!
//! A backend owns the process-wide trap plumbing and performs the actual
//! host -> guest transition. [`NativeBackend`] runs guest code directly on the
//! host CPU; [`crate::testing::ScriptedBackend`] replays a scripted guest so
//! the protocol can be exercised on any host.

use std::ptr::NonNull;

use nce_core::{ControlBlock, GuestContext, NceConfig, NceResult};
use nce_platform::HostThreadId;

use crate::engine::CoreState;

/// How the guest is (re-)entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPath {
    /// Jump to a patched re-entry trampoline registered for the guest `pc`.
    Trampoline(u64),
    /// Signal the current thread; the enter handler swaps in guest state.
    ExceptionLevelChange,
}

/// Everything a backend needs to enter the guest once.
///
/// Created by the run loop after the control block has been bound and is
/// still locked; the enter transition releases the lock.
pub struct GuestEntry<'a> {
    control: &'a ControlBlock,
    core: NonNull<CoreState>,
    thread_id: HostThreadId,
    path: EntryPath,
}

impl<'a> GuestEntry<'a> {
    pub(crate) fn new(
        control: &'a ControlBlock,
        core: NonNull<CoreState>,
        thread_id: HostThreadId,
        path: EntryPath,
    ) -> Self {
        Self {
            control,
            core,
            thread_id,
            path,
        }
    }

    pub fn control(&self) -> &'a ControlBlock {
        self.control
    }

    pub fn path(&self) -> EntryPath {
        self.path
    }

    pub fn thread_id(&self) -> HostThreadId {
        self.thread_id
    }

    /// Register file bound to the control block.
    pub fn guest_ptr(&self) -> *mut GuestContext {
        self.core.as_ptr().cast()
    }

    pub(crate) fn core_ptr(&self) -> NonNull<CoreState> {
        self.core
    }
}

/// Host side of the trap protocol.
pub trait TrapBackend: Send + Sync + 'static {
    /// Per-execution-thread resources, e.g. the alternate signal stack.
    type ThreadResources: Send;

    /// Installs the process-wide trap handlers. Idempotent; every call after
    /// the first returns the cached result.
    fn initialize(&self) -> NceResult<()>;

    /// Sets up what the calling thread needs before it can run guest code.
    fn prepare_thread(&self, config: &NceConfig) -> NceResult<Self::ThreadResources>;

    fn current_thread_id(&self) -> HostThreadId;

    /// Forces `thread` out of guest code.
    fn interrupt(&self, thread: HostThreadId) -> NceResult<()>;

    /// Enters the guest and returns the raw halt bits once control is back.
    ///
    /// # Safety
    ///
    /// Must be called on the thread identified by `entry.thread_id()`, with
    /// the control block locked and bound to `entry.guest_ptr()`. Nothing else
    /// may access the core state until this returns.
    unsafe fn run_guest(&self, entry: GuestEntry<'_>) -> u64;

    /// Makes freshly patched guest code visible to instruction fetch.
    fn clear_instruction_cache(&self) {
        nce_platform::barrier_full();
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        pub use crate::arch::NativeBackend;
    } else {
        use nce_core::NceError;

        /// Native execution is unavailable on this host; the type has no values.
        #[derive(Debug)]
        pub enum NativeBackend {}

        impl NativeBackend {
            pub fn new() -> NceResult<Self> {
                Err(NceError::UnsupportedHost {
                    os: nce_platform::host_os(),
                    arch: nce_platform::host_arch(),
                })
            }
        }

        impl TrapBackend for NativeBackend {
            type ThreadResources = ();

            fn initialize(&self) -> NceResult<()> {
                match *self {}
            }

            fn prepare_thread(&self, _config: &NceConfig) -> NceResult<()> {
                match *self {}
            }

            fn current_thread_id(&self) -> HostThreadId {
                match *self {}
            }

            fn interrupt(&self, _thread: HostThreadId) -> NceResult<()> {
                match *self {}
            }

            unsafe fn run_guest(&self, _entry: GuestEntry<'_>) -> u64 {
                match *self {}
            }
        }
    }
}
