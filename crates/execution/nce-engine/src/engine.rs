//! 原生执行引擎
//!
//! 每个模拟核心一个 [`NativeEngine`]。它拥有客户机寄存器文件和故障分发器，
//! 在执行线程上运行 [`GuestThread`]，并通过 [`Interrupter`] 接受其他线程的中断请求。
//!
//! 运行循环与中断方之间的握手在 [`nce_core::ControlBlock`] 上实现（`begin_run`、
//! `finish_run`、`request_interrupt`）：绑定在持锁时完成，进入客户机的转换
//! 负责释放锁，每条回到宿主的路径都持锁返回，由运行循环在解绑后释放。
//!
//! 引擎只能在调用 `initialize` 的线程上运行客户机：进入信号按线程标识投递。

use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use log::{debug, info, trace, warn};
use nce_core::{
    GuestContext, GuestMemory, HaltReason, HaltReasonCell, NUM_SVC_ARGS, NceConfig,
    NceError, NceResult, ThreadContext,
};
use nce_mem::{MaintenanceTask, TranslationCache};
use nce_platform::HostThreadId;

use crate::backend::{EntryPath, GuestEntry, NativeBackend, TrapBackend};
use crate::dispatch::{FaultDispatcher, FaultStats};
use crate::interp;
use crate::thread::GuestThread;

/// 陷入胶水通过 `native_context` 找到的核心状态
///
/// `guest` 必须是第一个字段：胶水拿到的 `*mut GuestContext` 就是 `*mut CoreState`。
#[repr(C)]
pub(crate) struct CoreState {
    pub(crate) guest: GuestContext,
    pub(crate) dispatcher: FaultDispatcher,
}

/// 引擎与中断方共享的状态
struct EngineShared {
    core_index: usize,
    thread_id: OnceLock<HostThreadId>,
    halt: Arc<HaltReasonCell>,
}

/// 单核原生执行引擎
pub struct NativeEngine<B: TrapBackend = NativeBackend> {
    config: NceConfig,
    core: NonNull<CoreState>,
    tlb: Arc<TranslationCache>,
    backend: Arc<B>,
    shared: Arc<EngineShared>,
    resources: Option<B::ThreadResources>,
    maintenance: Option<MaintenanceTask>,
}

// SAFETY: `core` is uniquely owned by the engine. The trap glue only reaches
// it through the control block while the engine is inside `run_thread`.
unsafe impl<B: TrapBackend> Send for NativeEngine<B> {}

impl NativeEngine<NativeBackend> {
    /// 在本机上直接执行客户机代码的引擎
    pub fn new(
        core_index: usize,
        memory: Arc<dyn GuestMemory>,
        config: NceConfig,
    ) -> NceResult<Self> {
        let backend = NativeBackend::new()?;
        Self::with_backend(core_index, memory, config, Arc::new(backend))
    }
}

impl<B: TrapBackend> NativeEngine<B> {
    pub fn with_backend(
        core_index: usize,
        memory: Arc<dyn GuestMemory>,
        config: NceConfig,
        backend: Arc<B>,
    ) -> NceResult<Self> {
        config.validate()?;

        let tlb = Arc::new(TranslationCache::from_config(&config));
        let halt = Arc::new(HaltReasonCell::new());
        let core = Box::new(CoreState {
            guest: GuestContext::with_halt(Arc::clone(&halt)),
            dispatcher: FaultDispatcher::new(memory, Arc::clone(&tlb), &config),
        });

        debug!(
            "Created native engine for core {core_index} (tlb capacity {})",
            config.tlb_capacity
        );
        Ok(Self {
            config,
            core: NonNull::from(Box::leak(core)),
            tlb,
            backend,
            shared: Arc::new(EngineShared {
                core_index,
                thread_id: OnceLock::new(),
                halt,
            }),
            resources: None,
            maintenance: None,
        })
    }

    // ========================================================================
    // 初始化
    // ========================================================================

    /// 在执行线程上调用
    ///
    /// 记录线程标识，准备线程资源（备用信号栈），安装陷入处理器，并按配置启动
    /// TLB 维护任务。可以在同一线程上重复调用；从其他线程调用返回 `WrongThread`。
    pub fn initialize(&mut self) -> NceResult<()> {
        let current = self.backend.current_thread_id();
        let thread_id = *self.shared.thread_id.get_or_init(|| current);
        self.check_thread(thread_id, current)?;

        if self.resources.is_none() {
            self.resources = Some(self.backend.prepare_thread(&self.config)?);
        }
        self.backend.initialize()?;

        if self.config.enable_maintenance && self.maintenance.is_none() {
            self.maintenance = Some(MaintenanceTask::spawn(
                Arc::clone(&self.tlb),
                self.config.sweep_interval(),
            )?);
        }

        info!(
            "Native engine for core {} initialized on thread {thread_id}",
            self.shared.core_index
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.thread_id.get().is_some() && self.resources.is_some()
    }

    /// 已初始化且调用者就是执行线程时返回它的标识
    fn thread_id(&self) -> NceResult<HostThreadId> {
        let thread_id = self
            .shared
            .thread_id
            .get()
            .copied()
            .ok_or(NceError::NotInitialized {
                core_index: self.shared.core_index,
            })?;
        self.check_thread(thread_id, self.backend.current_thread_id())?;
        Ok(thread_id)
    }

    fn check_thread(&self, expected: HostThreadId, actual: HostThreadId) -> NceResult<()> {
        if expected == actual {
            return Ok(());
        }
        warn!(
            "Core {} is bound to thread {expected}, refusing call from thread {actual}",
            self.shared.core_index
        );
        Err(NceError::WrongThread {
            core_index: self.shared.core_index,
            expected: expected.raw(),
            actual: actual.raw(),
        })
    }

    // ========================================================================
    // 运行
    // ========================================================================

    /// 运行客户机线程直到它因某个原因返回宿主
    pub fn run_thread(&mut self, thread: &dyn GuestThread) -> NceResult<HaltReason> {
        let thread_id = self.thread_id()?;
        let control = thread.control_block();

        let (tpidr, tpidrro) = (self.guest().tpidr_el0, self.guest().tpidrro_el0);
        let native: *mut GuestContext = self.guest_mut();
        if let Some(pending) = control.begin_run(&self.shared.halt, native, tpidr, tpidrro) {
            return Ok(pending);
        }

        let path = match thread.post_handler(self.guest().pc) {
            Some(trampoline) => EntryPath::Trampoline(trampoline),
            None => EntryPath::ExceptionLevelChange,
        };
        trace!(
            "Core {} entering guest at {:#x} via {path:?}",
            self.shared.core_index,
            self.guest().pc
        );

        let entry = GuestEntry::new(control, self.core, thread_id, path);
        // SAFETY: we are on the execution thread, the control block is locked
        // and bound to our core state, and we hold `&mut self`.
        let bits = unsafe { self.backend.run_guest(entry) };

        // 所有返回路径都持锁
        self.guest_mut().tpidr_el0 = control.finish_run();

        let reason = HaltReason::from_raw(bits);
        trace!("Core {} left guest: {reason:?}", self.shared.core_index);
        Ok(reason)
    }

    /// 解释执行一条指令
    ///
    /// 有挂起的停机原因时直接返回它们。无法解码的指令不推进 `pc`。
    pub fn step_thread(&mut self, _thread: &dyn GuestThread) -> HaltReason {
        let pending = self.shared.halt.take();
        if !pending.is_empty() {
            return pending;
        }

        let core_index = self.shared.core_index;
        let CoreState { guest, dispatcher } = self.core_mut();
        match interp::execute_one(guest, dispatcher.memory().as_ref()) {
            Some(next_pc) => guest.pc = next_pc,
            None => debug!("Core {core_index} cannot step instruction at {:#x}", guest.pc),
        }
        HaltReason::STEP_THREAD
    }

    // ========================================================================
    // 寄存器
    // ========================================================================

    fn core_ref(&self) -> &CoreState {
        // SAFETY: the engine owns `core`; the glue does not touch it outside
        // `run_thread`, which needs `&mut self`.
        unsafe { self.core.as_ref() }
    }

    fn core_mut(&mut self) -> &mut CoreState {
        // SAFETY: as in `core_ref`, and `&mut self` makes the access unique.
        unsafe { self.core.as_mut() }
    }

    pub fn guest(&self) -> &GuestContext {
        &self.core_ref().guest
    }

    pub fn guest_mut(&mut self) -> &mut GuestContext {
        &mut self.core_mut().guest
    }

    pub fn svc_number(&self) -> u32 {
        self.guest().svc
    }

    pub fn svc_arguments(&self) -> [u64; NUM_SVC_ARGS] {
        self.guest().svc_arguments()
    }

    pub fn set_svc_arguments(&mut self, args: &[u64; NUM_SVC_ARGS]) {
        self.guest_mut().set_svc_arguments(args);
    }

    pub fn context(&self) -> ThreadContext {
        self.guest().thread_context()
    }

    pub fn set_context(&mut self, ctx: &ThreadContext) {
        self.guest_mut().load_thread_context(ctx);
    }

    pub fn set_tpidrro_el0(&mut self, value: u64) {
        self.guest_mut().tpidrro_el0 = value;
    }

    // ========================================================================
    // 中断与锁
    // ========================================================================

    /// 可以交给其他线程的中断句柄
    pub fn interrupter(&self) -> Interrupter<B> {
        Interrupter {
            shared: Arc::clone(&self.shared),
            backend: Arc::clone(&self.backend),
        }
    }

    pub fn signal_interrupt(&self, thread: &dyn GuestThread) -> NceResult<()> {
        self.interrupter().signal_interrupt(thread)
    }

    pub fn lock_thread(&self, thread: &dyn GuestThread) {
        thread.control_block().lock();
    }

    pub fn unlock_thread(&self, thread: &dyn GuestThread) {
        thread.control_block().unlock();
    }

    // ========================================================================
    // 维护
    // ========================================================================

    /// 客户机代码被修改后调用
    pub fn invalidate_cache_range(&self, addr: u64, size: u64) {
        trace!("Instruction cache invalidate {addr:#x}+{size:#x}");
        self.backend.clear_instruction_cache();
    }

    /// 客户机内存映射变化后调用，返回失效的 TLB 条目数
    pub fn invalidate_translation_range(&self, addr: u64, size: u64) -> usize {
        self.tlb.invalidate_range(addr, size)
    }

    pub fn fault_stats(&self) -> FaultStats {
        self.core_ref().dispatcher.stats()
    }

    pub fn tlb(&self) -> &Arc<TranslationCache> {
        &self.tlb
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &NceConfig {
        &self.config
    }

    pub fn core_index(&self) -> usize {
        self.shared.core_index
    }

    pub fn maintenance_running(&self) -> bool {
        self.maintenance.as_ref().is_some_and(MaintenanceTask::is_running)
    }
}

impl<B: TrapBackend> Drop for NativeEngine<B> {
    fn drop(&mut self) {
        if let Some(mut task) = self.maintenance.take() {
            task.stop();
        }
        // SAFETY: `core` came from `Box::leak` in `with_backend` and is no
        // longer bound to any control block.
        drop(unsafe { Box::from_raw(self.core.as_ptr()) });
        // 备用信号栈在 resources 字段析构时释放
    }
}

impl<B: TrapBackend> std::fmt::Debug for NativeEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("core_index", &self.shared.core_index)
            .field("thread_id", &self.shared.thread_id.get())
            .field("guest", self.guest())
            .field("tlb_entries", &self.tlb.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Interrupter
// ============================================================================

/// 从其他线程打断引擎
pub struct Interrupter<B: TrapBackend = NativeBackend> {
    shared: Arc<EngineShared>,
    backend: Arc<B>,
}

impl<B: TrapBackend> Clone for Interrupter<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: TrapBackend> Interrupter<B> {
    /// 请求 `thread` 离开客户机
    ///
    /// 总是记录 `BREAK_LOOP`。线程正在执行客户机代码时发送中断信号并保持持锁，
    /// 由运行循环在返回后释放；否则立即解锁，运行循环在下次进入前看到停机原因。
    pub fn signal_interrupt(&self, thread: &dyn GuestThread) -> NceResult<()> {
        let core_index = self.shared.core_index;
        thread
            .control_block()
            .request_interrupt(&self.shared.halt, || {
                let thread_id = self
                    .shared
                    .thread_id
                    .get()
                    .copied()
                    .ok_or(NceError::NotInitialized { core_index })?;
                self.backend.interrupt(thread_id)?;
                trace!("Interrupt sent to core {core_index} thread {thread_id}");
                Ok(())
            })?;
        Ok(())
    }

    pub fn lock_thread(&self, thread: &dyn GuestThread) {
        thread.control_block().lock();
    }

    pub fn unlock_thread(&self, thread: &dyn GuestThread) {
        thread.control_block().unlock();
    }

    pub fn core_index(&self) -> usize {
        self.shared.core_index
    }
}

impl<B: TrapBackend> std::fmt::Debug for Interrupter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("core_index", &self.shared.core_index)
            .finish_non_exhaustive()
    }
}
