//! Test doubles: an in-memory guest address space and a scripted trap backend.
//!
//! [`ScriptedBackend`] follows the same lock and context-switch protocol as
//! the native backend, but instead of running guest code it replays a queue
//! of [`GuestEvent`]s against a [`CapturedContext`].

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use log::debug;
use nce_core::{GuestMemory, NceConfig, NceError, NceResult};
use nce_platform::{CapturedContext, FaultCode, FaultInfo, HostThreadId};
use parking_lot::{Condvar, Mutex};

use crate::backend::{EntryPath, GuestEntry, TrapBackend};
use crate::dispatch::FaultOutcome;
use crate::engine::CoreState;
use crate::switch;

// ============================================================================
// RecordingMemory
// ============================================================================

/// Flat guest memory with switchable answers for the memory manager calls.
pub struct RecordingMemory {
    base: u64,
    data: Mutex<Vec<u8>>,
    invalidate_result: AtomicBool,
    pointer_available: AtomicBool,
    remap_result: AtomicBool,
    remap_restores_pointer: AtomicBool,
    writable: AtomicBool,
    invalidate_calls: AtomicUsize,
    get_pointer_calls: AtomicUsize,
    remap_calls: AtomicUsize,
}

impl RecordingMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: Mutex::new(vec![0; size]),
            invalidate_result: AtomicBool::new(true),
            pointer_available: AtomicBool::new(true),
            remap_result: AtomicBool::new(true),
            remap_restores_pointer: AtomicBool::new(false),
            writable: AtomicBool::new(true),
            invalidate_calls: AtomicUsize::new(0),
            get_pointer_calls: AtomicUsize::new(0),
            remap_calls: AtomicUsize::new(0),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn set_invalidate_result(&self, value: bool) {
        self.invalidate_result.store(value, Ordering::SeqCst);
    }

    pub fn set_pointer_available(&self, value: bool) {
        self.pointer_available.store(value, Ordering::SeqCst);
    }

    pub fn set_remap_result(&self, value: bool) {
        self.remap_result.store(value, Ordering::SeqCst);
    }

    /// A successful remap makes `get_pointer` succeed afterwards.
    pub fn set_remap_restores_pointer(&self, value: bool) {
        self.remap_restores_pointer.store(value, Ordering::SeqCst);
    }

    pub fn set_writable(&self, value: bool) {
        self.writable.store(value, Ordering::SeqCst);
    }

    pub fn invalidate_calls(&self) -> usize {
        self.invalidate_calls.load(Ordering::SeqCst)
    }

    pub fn get_pointer_calls(&self) -> usize {
        self.get_pointer_calls.load(Ordering::SeqCst)
    }

    pub fn remap_calls(&self) -> usize {
        self.remap_calls.load(Ordering::SeqCst)
    }

    fn offset(&self, addr: u64, len: usize) -> Option<usize> {
        let offset = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = offset.checked_add(len)?;
        (end <= self.data.lock().len()).then_some(offset)
    }
}

impl GuestMemory for RecordingMemory {
    fn invalidate_nce(&self, _addr: u64, _size: u64) -> bool {
        self.invalidate_calls.fetch_add(1, Ordering::SeqCst);
        self.invalidate_result.load(Ordering::SeqCst)
    }

    fn get_pointer(&self, addr: u64) -> Option<NonNull<u8>> {
        self.get_pointer_calls.fetch_add(1, Ordering::SeqCst);
        if !self.pointer_available.load(Ordering::SeqCst) {
            return None;
        }
        let offset = self.offset(addr, 1)?;
        let data = self.data.lock();
        NonNull::new(data[offset..].as_ptr().cast_mut())
    }

    fn remap(&self, _addr: u64, _size: u64) -> bool {
        self.remap_calls.fetch_add(1, Ordering::SeqCst);
        let ok = self.remap_result.load(Ordering::SeqCst);
        if ok && self.remap_restores_pointer.load(Ordering::SeqCst) {
            self.set_pointer_available(true);
        }
        ok
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        let Some(offset) = self.offset(addr, buf.len()) else {
            return false;
        };
        buf.copy_from_slice(&self.data.lock()[offset..offset + buf.len()]);
        true
    }

    fn write(&self, addr: u64, data: &[u8]) -> bool {
        let Some(offset) = self.offset(addr, data.len()) else {
            return false;
        };
        self.data.lock()[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    fn is_writable(&self, _addr: u64) -> bool {
        self.writable.load(Ordering::SeqCst)
    }
}

// ============================================================================
// ScriptedBackend
// ============================================================================

/// Return address planted in the host context before entering the guest.
pub const HOST_LR: u64 = 0x0000_5555_0000_0ff0;
/// Host stack pointer at the run loop call site.
pub const HOST_SP: u64 = 0x0000_7fff_ffff_e000;
/// Host thread pointer parked while the guest runs.
pub const HOST_TPIDR: u64 = 0x0000_7fff_f7ff_0700;

/// One step of scripted guest behaviour.
pub enum GuestEvent {
    /// Guest access faults at `address`.
    AccessFault { address: u64, code: FaultCode },
    /// Guest faults on a misaligned access at its current `pc`.
    AlignmentFault,
    /// Guest executes `svc #imm`.
    SupervisorCall(u32),
    /// Guest spins until an interrupt arrives.
    WaitForInterrupt,
    /// Guest code runs and changes its registers.
    Mutate(Box<dyn FnMut(&mut CapturedContext) + Send>),
}

impl GuestEvent {
    pub fn access_fault(address: u64) -> Self {
        Self::AccessFault {
            address,
            code: FaultCode::Unmapped,
        }
    }

    pub fn mutate(f: impl FnMut(&mut CapturedContext) + Send + 'static) -> Self {
        Self::Mutate(Box::new(f))
    }
}

impl std::fmt::Debug for GuestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessFault { address, code } => f
                .debug_struct("AccessFault")
                .field("address", &format_args!("{address:#x}"))
                .field("code", code)
                .finish(),
            Self::AlignmentFault => f.write_str("AlignmentFault"),
            Self::SupervisorCall(imm) => f.debug_tuple("SupervisorCall").field(imm).finish(),
            Self::WaitForInterrupt => f.write_str("WaitForInterrupt"),
            Self::Mutate(_) => f.write_str("Mutate(..)"),
        }
    }
}

static NEXT_THREAD_ID: AtomicI64 = AtomicI64::new(1000);

thread_local! {
    static THREAD_ID: Cell<i64> = const { Cell::new(0) };
}

/// Backend that replays [`GuestEvent`]s instead of running guest code.
///
/// An empty script behaves like a guest that waits for an interrupt.
#[derive(Default)]
pub struct ScriptedBackend {
    events: Mutex<VecDeque<GuestEvent>>,
    pending: Mutex<HashMap<HostThreadId, usize>>,
    interrupted: Condvar,
    delivered: AtomicUsize,
    install: OnceLock<NceResult<()>>,
    install_error: Option<NceError>,
    installations: AtomicUsize,
    prepared_threads: AtomicUsize,
    cache_flushes: AtomicUsize,
    entries: Mutex<Vec<EntryPath>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose handler installation fails with `error`.
    pub fn failing_install(error: NceError) -> Self {
        Self {
            install_error: Some(error),
            ..Self::default()
        }
    }

    pub fn push(&self, event: GuestEvent) {
        self.events.lock().push_back(event);
    }

    pub fn script(&self, events: impl IntoIterator<Item = GuestEvent>) {
        self.events.lock().extend(events);
    }

    pub fn remaining_events(&self) -> usize {
        self.events.lock().len()
    }

    pub fn installations(&self) -> usize {
        self.installations.load(Ordering::SeqCst)
    }

    pub fn prepared_threads(&self) -> usize {
        self.prepared_threads.load(Ordering::SeqCst)
    }

    pub fn delivered_interrupts(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn cache_flushes(&self) -> usize {
        self.cache_flushes.load(Ordering::SeqCst)
    }

    /// Entry paths in the order the guest was entered.
    pub fn entry_paths(&self) -> Vec<EntryPath> {
        self.entries.lock().clone()
    }

    fn take_interrupt(&self, thread: HostThreadId) -> bool {
        self.pending.lock().remove(&thread).is_some_and(|n| n > 0)
    }

    fn wait_for_interrupt(&self, thread: HostThreadId) {
        let mut pending = self.pending.lock();
        while pending.get(&thread).copied().unwrap_or(0) == 0 {
            self.interrupted.wait(&mut pending);
        }
    }
}

impl TrapBackend for ScriptedBackend {
    type ThreadResources = ();

    fn initialize(&self) -> NceResult<()> {
        self.install
            .get_or_init(|| {
                self.installations.fetch_add(1, Ordering::SeqCst);
                match &self.install_error {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                }
            })
            .clone()
    }

    fn prepare_thread(&self, _config: &NceConfig) -> NceResult<()> {
        self.prepared_threads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_thread_id(&self) -> HostThreadId {
        THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            HostThreadId(id.get())
        })
    }

    fn interrupt(&self, thread: HostThreadId) -> NceResult<()> {
        *self.pending.lock().entry(thread).or_insert(0) += 1;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        self.interrupted.notify_all();
        Ok(())
    }

    unsafe fn run_guest(&self, entry: GuestEntry<'_>) -> u64 {
        let thread = entry.thread_id();
        let control = entry.control();
        self.entries.lock().push(entry.path());
        // SAFETY: the caller guarantees exclusive access to the core state
        // until we return.
        let CoreState { guest, dispatcher } = unsafe { &mut *entry.core_ptr().as_ptr() };

        // 信号到达时宿主停在 run_guest 调用点
        let mut ctx = CapturedContext::default();
        ctx.regs[30] = HOST_LR;
        ctx.sp = HOST_SP;

        // 进入客户机前投递的中断在真实主机上会被忽略
        self.take_interrupt(thread);

        switch::restore_guest_context(guest, &mut ctx);
        guest.host_ctx.host_tpidr_el0 = HOST_TPIDR;
        control.unlock();

        loop {
            if self.take_interrupt(thread) {
                debug!("Scripted guest on thread {thread} interrupted");
                switch::save_guest_context(guest, &mut ctx);
                return ctx.regs[0];
            }

            let event = self
                .events
                .lock()
                .pop_front()
                .unwrap_or(GuestEvent::WaitForInterrupt);
            match event {
                GuestEvent::AccessFault { address, code } => {
                    let fault = FaultInfo::new(address, code);
                    if dispatcher.handle_access_fault(guest, control, &mut ctx, fault)
                        == FaultOutcome::ReturnToHost
                    {
                        return ctx.regs[0];
                    }
                }
                GuestEvent::AlignmentFault => {
                    dispatcher.handle_alignment_fault(&mut ctx);
                }
                GuestEvent::SupervisorCall(imm) => {
                    switch::trap_supervisor_call(guest, control, &mut ctx, imm);
                    return ctx.regs[0];
                }
                GuestEvent::WaitForInterrupt => self.wait_for_interrupt(thread),
                GuestEvent::Mutate(mut f) => f(&mut ctx),
            }
        }
    }

    fn clear_instruction_cache(&self) {
        self.cache_flushes.fetch_add(1, Ordering::SeqCst);
        nce_platform::barrier_full();
    }
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("remaining_events", &self.remaining_events())
            .field("installations", &self.installations())
            .field("delivered_interrupts", &self.delivered_interrupts())
            .finish_non_exhaustive()
    }
}
