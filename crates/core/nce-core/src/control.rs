//! Per-thread control block shared between the execution engine and external
//! controllers.
//!
//! The block is `#[repr(C)]` because the trap glue reads it through the guest's
//! `tpidr_el0` before any Rust code runs; offsets live in [`crate::offsets`].

use std::fmt;
use std::ptr;

use crate::context::GuestContext;
use crate::halt::{HaltReason, HaltReasonCell};
use crate::sync::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering, spin_hint};

/// Validation tag stored in every control block ("NCEB").
pub const CONTROL_BLOCK_MAGIC: u32 = 0x4E43_4542;

/// Observable states of a [`SpinLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockState {
    Unlocked = 0,
    Locked = 1,
}

impl LockState {
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

/// Binary spinlock with a fixed 32-bit representation.
#[repr(transparent)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(LockState::Unlocked.raw()),
        }
    }

    pub fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            while self.state.load(Ordering::Relaxed) == LockState::Locked.raw() {
                spin_hint();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(
                LockState::Unlocked.raw(),
                LockState::Locked.raw(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn unlock(&self) {
        self.state.store(LockState::Unlocked.raw(), Ordering::Release);
    }

    /// Marks the lock as held without waiting for it.
    ///
    /// Only the trap path uses this: it runs on the thread that is about to
    /// return to the host and must not spin inside a signal handler. If an
    /// interrupter already holds the lock, both sides now agree it is held and
    /// the run loop releases it once.
    pub fn force_lock(&self) {
        self.state.store(LockState::Locked.raw(), Ordering::SeqCst);
    }

    pub fn state(&self) -> LockState {
        match self.state.load(Ordering::Acquire) {
            0 => LockState::Unlocked,
            _ => LockState::Locked,
        }
    }

    /// Raw value, for checking that the lock word never holds anything else.
    pub fn raw(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SpinLock").field(&self.state()).finish()
    }
}

/// Handshake structure for one guest thread.
///
/// Owned by the guest thread abstraction. The engine publishes its register
/// file here only while the thread is scheduled on it.
#[repr(C)]
pub struct ControlBlock {
    pub(crate) tpidr_el0: AtomicU64,
    pub(crate) tpidrro_el0: AtomicU64,
    pub(crate) native_context: AtomicPtr<GuestContext>,
    pub(crate) lock: SpinLock,
    pub(crate) is_running: AtomicBool,
    pub(crate) magic: u32,
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            tpidr_el0: AtomicU64::new(0),
            tpidrro_el0: AtomicU64::new(0),
            native_context: AtomicPtr::new(ptr::null_mut()),
            lock: SpinLock::new(),
            is_running: AtomicBool::new(false),
            magic: CONTROL_BLOCK_MAGIC,
        }
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn force_lock(&self) {
        self.lock.force_lock();
    }

    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    pub fn spin_lock(&self) -> &SpinLock {
        &self.lock
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::SeqCst);
    }

    pub fn is_valid(&self) -> bool {
        self.magic == CONTROL_BLOCK_MAGIC
    }

    pub fn tpidr_el0(&self) -> u64 {
        self.tpidr_el0.load(Ordering::Acquire)
    }

    pub fn set_tpidr_el0(&self, value: u64) {
        self.tpidr_el0.store(value, Ordering::Release);
    }

    pub fn tpidrro_el0(&self) -> u64 {
        self.tpidrro_el0.load(Ordering::Acquire)
    }

    pub fn set_tpidrro_el0(&self, value: u64) {
        self.tpidrro_el0.store(value, Ordering::Release);
    }

    /// Register file currently bound to this thread, or null.
    pub fn native_context(&self) -> *mut GuestContext {
        self.native_context.load(Ordering::Acquire)
    }

    /// Publishes (or clears, with null) the bound register file.
    pub fn set_native_context(&self, context: *mut GuestContext) {
        self.native_context.store(context, Ordering::Release);
    }

    /// Raw pointer handed to the trap glue. The glue only performs atomic
    /// accesses through it.
    pub fn as_raw(&self) -> *mut ControlBlock {
        ptr::from_ref(self).cast_mut()
    }
}

// ============================================================================
// 运行循环与中断方的握手
// ============================================================================

impl ControlBlock {
    /// 运行循环一侧：加锁并发布寄存器文件
    ///
    /// 有挂起的停机原因时（包括绑定期间到达、看到 `is_running == false` 的中断）
    /// 解绑、解锁并返回它们。返回 `None` 时锁仍然持有，由进入客户机的转换释放。
    pub fn begin_run(
        &self,
        halt: &HaltReasonCell,
        context: *mut GuestContext,
        tpidr_el0: u64,
        tpidrro_el0: u64,
    ) -> Option<HaltReason> {
        let pending = halt.take();
        if !pending.is_empty() {
            return Some(pending);
        }

        self.lock();
        self.set_native_context(context);
        self.set_tpidr_el0(tpidr_el0);
        self.set_tpidrro_el0(tpidrro_el0);
        self.set_running(true);

        let pending = halt.take();
        if pending.is_empty() {
            return None;
        }
        self.finish_run();
        Some(pending)
    }

    /// 运行循环一侧：回到宿主后解绑并释放锁
    ///
    /// 调用时必须持锁。返回客户机最后的 `tpidr_el0`。
    pub fn finish_run(&self) -> u64 {
        let tpidr = self.tpidr_el0();
        self.set_native_context(ptr::null_mut());
        self.set_running(false);
        self.unlock();
        tpidr
    }

    /// 中断方一侧
    ///
    /// 总是记录 `BREAK_LOOP`。线程正在运行时调用 `deliver` 并保持持锁，返回
    /// `Ok(true)`；否则立即解锁并返回 `Ok(false)`。`deliver` 失败时解锁并返回其错误。
    pub fn request_interrupt<E>(
        &self,
        halt: &HaltReasonCell,
        deliver: impl FnOnce() -> Result<(), E>,
    ) -> Result<bool, E> {
        halt.raise(HaltReason::BREAK_LOOP);

        self.lock();
        if !self.is_running() {
            self.unlock();
            return Ok(false);
        }
        if let Err(err) = deliver() {
            self.unlock();
            return Err(err);
        }
        Ok(true)
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("tpidr_el0", &format_args!("{:#x}", self.tpidr_el0()))
            .field("tpidrro_el0", &format_args!("{:#x}", self.tpidrro_el0()))
            .field("native_context", &self.native_context())
            .field("lock", &self.lock)
            .field("is_running", &self.is_running())
            .field("valid", &self.is_valid())
            .finish()
    }
}

// SAFETY: every mutable field is atomic; `native_context` is only dereferenced
// by the engine that published it, on its own execution thread.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[test]
    fn test_new_block_is_unlocked_and_idle() {
        let block = ControlBlock::new();
        assert_eq!(block.lock_state(), LockState::Unlocked);
        assert!(!block.is_running());
        assert!(block.is_valid());
        assert!(block.native_context().is_null());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let block = ControlBlock::new();
        block.lock();
        assert!(!block.try_lock());
        block.unlock();
        assert!(block.try_lock());
        block.unlock();
    }

    #[test]
    fn test_force_lock_on_held_lock_stays_locked() {
        let block = ControlBlock::new();
        block.lock();
        block.force_lock();
        assert_eq!(block.lock_state(), LockState::Locked);
        block.unlock();
        assert_eq!(block.lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_begin_run_binds_and_keeps_lock() {
        let block = ControlBlock::new();
        let halt = HaltReasonCell::new();
        let mut guest = GuestContext::new();
        let native: *mut GuestContext = &mut guest;

        assert_eq!(block.begin_run(&halt, native, 0x11, 0x22), None);
        assert_eq!(block.lock_state(), LockState::Locked);
        assert!(block.is_running());
        assert_eq!(block.native_context(), native);
        assert_eq!(block.tpidrro_el0(), 0x22);

        block.set_tpidr_el0(0x33);
        assert_eq!(block.finish_run(), 0x33);
        assert_eq!(block.lock_state(), LockState::Unlocked);
        assert!(!block.is_running());
        assert!(block.native_context().is_null());
    }

    #[test]
    fn test_begin_run_returns_pending_reasons_unlocked() {
        let block = ControlBlock::new();
        let halt = HaltReasonCell::new();
        let mut guest = GuestContext::new();
        halt.raise(HaltReason::BREAK_LOOP);

        let pending = block.begin_run(&halt, &mut guest, 0, 0);

        assert_eq!(pending, Some(HaltReason::BREAK_LOOP));
        assert_eq!(block.lock_state(), LockState::Unlocked);
        assert!(!block.is_running());
        assert!(halt.peek().is_empty());
    }

    #[test]
    fn test_request_interrupt_on_idle_thread_releases_lock() {
        let block = ControlBlock::new();
        let halt = HaltReasonCell::new();

        let delivered = block
            .request_interrupt(&halt, || -> Result<(), ()> { panic!("idle thread signalled") })
            .unwrap();

        assert!(!delivered);
        assert_eq!(block.lock_state(), LockState::Unlocked);
        assert_eq!(halt.peek(), HaltReason::BREAK_LOOP);
    }

    #[test]
    fn test_request_interrupt_on_running_thread_keeps_lock() {
        let block = ControlBlock::new();
        let halt = HaltReasonCell::new();
        block.set_running(true);

        assert_eq!(block.request_interrupt(&halt, || Ok::<(), ()>(())), Ok(true));
        assert_eq!(block.lock_state(), LockState::Locked);
        block.unlock();

        assert_eq!(block.request_interrupt(&halt, || Err("tkill")), Err("tkill"));
        assert_eq!(block.lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_lock_word_never_torn_under_contention() {
        let block = Arc::new(ControlBlock::new());
        let stop = Arc::new(StdAtomicBool::new(false));

        let observer = {
            let block = Arc::clone(&block);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut samples = 0u64;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let raw = block.spin_lock().raw();
                    assert!(
                        raw == LockState::Unlocked.raw() || raw == LockState::Locked.raw(),
                        "lock word held {raw}"
                    );
                    samples += 1;
                }
                samples
            })
        };

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let block = Arc::clone(&block);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        if i % 2 == 0 {
                            block.lock();
                            block.unlock();
                        } else if block.try_lock() {
                            block.unlock();
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(observer.join().unwrap() > 0);
        assert_eq!(block.lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_mutual_exclusion() {
        let block = Arc::new(ControlBlock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let block = Arc::clone(&block);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        block.lock();
                        // Non-atomic read-modify-write made safe by the lock.
                        let value = counter.load(std::sync::atomic::Ordering::Relaxed);
                        counter.store(value + 1, std::sync::atomic::Ordering::Relaxed);
                        block.unlock();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 4_000);
    }
}
