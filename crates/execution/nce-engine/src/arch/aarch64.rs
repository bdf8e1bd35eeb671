//! AArch64 Linux 陷入胶水
//!
//! 客户机运行期间 `tpidr_el0` 指向它的 [`ControlBlock`]，宿主的值保存在
//! `GuestContext::host_ctx.host_tpidr_el0`。信号处理器的汇编入口先根据魔数判断
//! 陷入来自客户机还是宿主，恢复宿主 `tpidr_el0` 后才进入 Rust 代码；
//! 返回客户机前再把它换回控制块。

use std::arch::{asm, global_asm};
use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use log::{info, warn};
use nce_core::offsets::{
    CONTROL_LOCK, CONTROL_MAGIC, CONTROL_NATIVE_CONTEXT, GUEST_HOST_SAVED_REGS,
    GUEST_HOST_SAVED_VREGS, GUEST_HOST_SP, GUEST_HOST_TPIDR_EL0, GUEST_SP,
};
use nce_core::{CONTROL_BLOCK_MAGIC, ControlBlock, GuestContext, LockState, NceConfig, NceResult};
use nce_platform::altstack::SignalStack;
use nce_platform::signals::{
    self, BREAK_FROM_GUEST_SIGNAL, GUEST_ACCESS_FAULT_SIGNAL, GUEST_ALIGNMENT_FAULT_SIGNAL,
    GUEST_ENTER_SIGNAL, SigInfoHandler,
};
use nce_platform::{FaultInfo, HostContext, HostThreadId, UcontextView};

use crate::backend::{EntryPath, GuestEntry, TrapBackend};
use crate::dispatch::FaultOutcome;
use crate::engine::CoreState;
use crate::switch;

// 汇编用 `stlr wzr` 解锁
const _: () = assert!(LockState::Unlocked as u32 == 0);
// `add xN, xM, #imm` 只接受 12 位立即数
const _: () = assert!(GUEST_HOST_SAVED_REGS < 4096 && GUEST_HOST_SAVED_VREGS < 4096);
const _: () = assert!(CONTROL_LOCK < 4096);

/// 进入函数中 `svc #0` 之后的 `brk` 的偏移
const ENTER_RESUME_OFFSET: usize = 16;

global_asm!(
    ".text",
    // ------------------------------------------------------------------
    // u64 nce_return_to_run_code_by_exception_level_change(tid, control)
    // ------------------------------------------------------------------
    ".p2align 2",
    ".global nce_return_to_run_code_by_exception_level_change",
    ".type nce_return_to_run_code_by_exception_level_change, %function",
    "nce_return_to_run_code_by_exception_level_change:",
    "    mov x9, x1",
    "    mov x8, #{sys_tkill}",
    "    mov x1, #{enter_signal}",
    "    svc #0",
    "    brk #1000",
    // ------------------------------------------------------------------
    // u64 nce_return_to_run_code_by_trampoline(control, guest, trampoline)
    // ------------------------------------------------------------------
    ".p2align 2",
    ".global nce_return_to_run_code_by_trampoline",
    ".type nce_return_to_run_code_by_trampoline, %function",
    "nce_return_to_run_code_by_trampoline:",
    "    add x3, x1, #{host_saved_regs}",
    "    stp x19, x20, [x3, #0]",
    "    stp x21, x22, [x3, #16]",
    "    stp x23, x24, [x3, #32]",
    "    stp x25, x26, [x3, #48]",
    "    stp x27, x28, [x3, #64]",
    "    stp x29, x30, [x3, #80]",
    "    add x3, x1, #{host_saved_vregs}",
    "    stp q8, q9, [x3, #0]",
    "    stp q10, q11, [x3, #32]",
    "    stp q12, q13, [x3, #64]",
    "    stp q14, q15, [x3, #96]",
    "    mov x4, sp",
    "    str x4, [x1, #{host_sp}]",
    "    mrs x4, tpidr_el0",
    "    str x4, [x1, #{host_tpidr}]",
    "    ldr x4, [x1, #{guest_sp}]",
    "    mov sp, x4",
    "    msr tpidr_el0, x0",
    "    add x4, x0, #{control_lock}",
    "    stlr wzr, [x4]",
    "    br x2",
    // ------------------------------------------------------------------
    // GUEST_ENTER_SIGNAL
    // ------------------------------------------------------------------
    ".p2align 2",
    ".global nce_guest_enter_handler",
    ".type nce_guest_enter_handler, %function",
    "nce_guest_enter_handler:",
    "    stp x29, x30, [sp, #-16]!",
    "    mov x29, sp",
    "    mov x0, x2",
    "    bl {restore}",
    "    cbz x0, 1f",
    "    ldr x1, [x0, #{control_native_context}]",
    "    mrs x2, tpidr_el0",
    "    str x2, [x1, #{host_tpidr}]",
    "    msr tpidr_el0, x0",
    "    add x3, x0, #{control_lock}",
    "    stlr wzr, [x3]",
    "1:",
    "    ldp x29, x30, [sp], #16",
    "    ret",
    // ------------------------------------------------------------------
    // BREAK_FROM_GUEST_SIGNAL
    // ------------------------------------------------------------------
    ".p2align 2",
    ".global nce_guest_break_handler",
    ".type nce_guest_break_handler, %function",
    "nce_guest_break_handler:",
    "    mrs x3, tpidr_el0",
    "    cbz x3, 1f",
    "    ldr w4, [x3, #{control_magic}]",
    "    movz w5, #{magic_lo}",
    "    movk w5, #{magic_hi}, lsl #16",
    "    cmp w4, w5",
    "    b.ne 1f",
    "    ldr x0, [x3, #{control_native_context}]",
    "    ldr x4, [x0, #{host_tpidr}]",
    "    msr tpidr_el0, x4",
    "    mov x1, x2",
    "    b {save}",
    "1:",
    "    ret",
    // ------------------------------------------------------------------
    // GUEST_ACCESS_FAULT_SIGNAL
    // ------------------------------------------------------------------
    ".p2align 2",
    ".global nce_guest_access_fault_handler",
    ".type nce_guest_access_fault_handler, %function",
    "nce_guest_access_fault_handler:",
    "    stp x29, x30, [sp, #-32]!",
    "    mov x29, sp",
    "    str x19, [sp, #16]",
    "    mrs x19, tpidr_el0",
    "    cbz x19, 2f",
    "    ldr w4, [x19, #{control_magic}]",
    "    movz w5, #{magic_lo}",
    "    movk w5, #{magic_hi}, lsl #16",
    "    cmp w4, w5",
    "    b.ne 2f",
    "    ldr x4, [x19, #{control_native_context}]",
    "    ldr x4, [x4, #{host_tpidr}]",
    "    msr tpidr_el0, x4",
    "    mov x3, x2",
    "    mov x2, x1",
    "    mov x1, x19",
    "    bl {access_fault}",
    "    cbz x0, 1f",
    "    msr tpidr_el0, x19",
    "1:",
    "    ldr x19, [sp, #16]",
    "    ldp x29, x30, [sp], #32",
    "    ret",
    "2:",
    "    ldr x19, [sp, #16]",
    "    ldp x29, x30, [sp], #32",
    "    b {host_fault}",
    // ------------------------------------------------------------------
    // GUEST_ALIGNMENT_FAULT_SIGNAL
    // ------------------------------------------------------------------
    ".p2align 2",
    ".global nce_guest_alignment_fault_handler",
    ".type nce_guest_alignment_fault_handler, %function",
    "nce_guest_alignment_fault_handler:",
    "    stp x29, x30, [sp, #-32]!",
    "    mov x29, sp",
    "    str x19, [sp, #16]",
    "    mrs x19, tpidr_el0",
    "    cbz x19, 2f",
    "    ldr w4, [x19, #{control_magic}]",
    "    movz w5, #{magic_lo}",
    "    movk w5, #{magic_hi}, lsl #16",
    "    cmp w4, w5",
    "    b.ne 2f",
    "    ldr x4, [x19, #{control_native_context}]",
    "    ldr x4, [x4, #{host_tpidr}]",
    "    msr tpidr_el0, x4",
    "    mov x3, x2",
    "    mov x2, x1",
    "    mov x1, x19",
    "    bl {alignment_fault}",
    "    cbz x0, 1f",
    "    msr tpidr_el0, x19",
    "1:",
    "    ldr x19, [sp, #16]",
    "    ldp x29, x30, [sp], #32",
    "    ret",
    "2:",
    "    ldr x19, [sp, #16]",
    "    ldp x29, x30, [sp], #32",
    "    b {host_fault}",
    sys_tkill = const libc::SYS_tkill,
    enter_signal = const GUEST_ENTER_SIGNAL,
    host_saved_regs = const GUEST_HOST_SAVED_REGS,
    host_saved_vregs = const GUEST_HOST_SAVED_VREGS,
    host_sp = const GUEST_HOST_SP,
    host_tpidr = const GUEST_HOST_TPIDR_EL0,
    guest_sp = const GUEST_SP,
    control_lock = const CONTROL_LOCK,
    control_magic = const CONTROL_MAGIC,
    control_native_context = const CONTROL_NATIVE_CONTEXT,
    magic_lo = const CONTROL_BLOCK_MAGIC & 0xFFFF,
    magic_hi = const CONTROL_BLOCK_MAGIC >> 16,
    restore = sym restore_guest_entry,
    save = sym save_guest_exit,
    access_fault = sym handle_guest_access_fault,
    alignment_fault = sym handle_guest_alignment_fault,
    host_fault = sym handle_host_fault,
);

unsafe extern "C" {
    fn nce_return_to_run_code_by_exception_level_change(
        thread_id: i64,
        control: *mut ControlBlock,
    ) -> u64;
    fn nce_return_to_run_code_by_trampoline(
        control: *mut ControlBlock,
        guest: *mut GuestContext,
        trampoline: u64,
    ) -> u64;
    fn nce_guest_enter_handler(signal: i32, info: *mut libc::siginfo_t, raw: *mut c_void);
    fn nce_guest_break_handler(signal: i32, info: *mut libc::siginfo_t, raw: *mut c_void);
    fn nce_guest_access_fault_handler(signal: i32, info: *mut libc::siginfo_t, raw: *mut c_void);
    fn nce_guest_alignment_fault_handler(signal: i32, info: *mut libc::siginfo_t, raw: *mut c_void);
}

// ============================================================================
// 汇编入口调用的 Rust 部分
// ============================================================================

/// 进入信号：换入客户机状态，返回控制块；信号不是由进入函数发出时返回空指针
unsafe extern "C" fn restore_guest_entry(raw: *mut c_void) -> *mut ControlBlock {
    // SAFETY: `raw` is the ucontext of the signal being handled.
    let mut view = unsafe { UcontextView::from_raw(raw) };
    let enter_site = nce_return_to_run_code_by_exception_level_change as usize;
    if view.pc() as usize != enter_site + ENTER_RESUME_OFFSET {
        return ptr::null_mut();
    }

    let control = view.gpr(9) as *mut ControlBlock;
    // SAFETY: x9 was loaded from the run loop's control block right before
    // the signal was raised; the run loop keeps it alive and locked.
    let Some(control) = (unsafe { control.as_ref() }) else {
        return ptr::null_mut();
    };
    // SAFETY: bound by the run loop while the control block is locked.
    let Some(guest) = (unsafe { control.native_context().as_mut() }) else {
        return ptr::null_mut();
    };
    switch::restore_guest_context(guest, &mut view);
    control.as_raw()
}

/// 中断信号：保存客户机状态并返回宿主
unsafe extern "C" fn save_guest_exit(guest: *mut GuestContext, raw: *mut c_void) {
    // SAFETY: the glue loaded `guest` from a valid control block and `raw`
    // is the ucontext of the signal being handled.
    let (guest, mut view) = unsafe { (&mut *guest, UcontextView::from_raw(raw)) };
    switch::save_guest_context(guest, &mut view);
}

/// 返回非零时回到客户机
unsafe extern "C" fn handle_guest_access_fault(
    signal: i32,
    control: *mut ControlBlock,
    info: *mut libc::siginfo_t,
    raw: *mut c_void,
) -> u64 {
    // SAFETY: the glue checked the control block magic; `native_context` is
    // bound for as long as tpidr_el0 points at the control block.
    let (control, core, fault, mut view) = unsafe {
        let control = &*control;
        let core = &mut *control.native_context().cast::<CoreState>();
        (
            control,
            core,
            FaultInfo::from_siginfo(signal, info),
            UcontextView::from_raw(raw),
        )
    };
    let CoreState { guest, dispatcher } = core;
    match dispatcher.handle_access_fault(guest, control, &mut view, fault) {
        FaultOutcome::Resume => 1,
        FaultOutcome::ReturnToHost => 0,
    }
}

unsafe extern "C" fn handle_guest_alignment_fault(
    _signal: i32,
    control: *mut ControlBlock,
    _info: *mut libc::siginfo_t,
    raw: *mut c_void,
) -> u64 {
    // SAFETY: as in `handle_guest_access_fault`.
    let (core, mut view) = unsafe {
        let core = &*(*control).native_context().cast::<CoreState>();
        (core, UcontextView::from_raw(raw))
    };
    match core.dispatcher.handle_alignment_fault(&mut view) {
        FaultOutcome::Resume => 1,
        FaultOutcome::ReturnToHost => 0,
    }
}

unsafe extern "C" fn handle_host_fault(signal: i32, info: *mut libc::siginfo_t, raw: *mut c_void) {
    // SAFETY: forwarded unchanged from the kernel.
    unsafe { signals::chain_to_previous(signal, info, raw) };
}

// ============================================================================
// 信号安装
// ============================================================================

static INSTALL: OnceLock<NceResult<()>> = OnceLock::new();

fn install_handlers() -> NceResult<()> {
    let handlers: [(i32, SigInfoHandler, i32, bool); 4] = [
        (GUEST_ENTER_SIGNAL, nce_guest_enter_handler, 0, false),
        (BREAK_FROM_GUEST_SIGNAL, nce_guest_break_handler, 0, false),
        (GUEST_ALIGNMENT_FAULT_SIGNAL, nce_guest_alignment_fault_handler, 0, true),
        (GUEST_ACCESS_FAULT_SIGNAL, nce_guest_access_fault_handler, libc::SA_RESTART, true),
    ];
    for (signal, handler, flags, chain) in handlers {
        // SAFETY: the enter and break handlers only touch the interrupted
        // thread's control block and register file. The fault handlers also
        // log, take the TLB mutex and call into `GuestMemory`; they only do so
        // when the fault came from guest code, which runs inside `run_guest`
        // with none of those locks held by this thread. Host faults are
        // chained without touching any of them.
        unsafe { signals::install_handler(signal, handler, flags, chain)? };
    }
    info!("Native execution signal handlers installed");
    Ok(())
}

// ============================================================================
// NativeBackend
// ============================================================================

/// 直接在主机 CPU 上执行客户机代码
#[derive(Debug, Clone, Copy)]
pub struct NativeBackend {
    _private: (),
}

impl NativeBackend {
    pub fn new() -> NceResult<Self> {
        Ok(Self { _private: () })
    }
}

impl TrapBackend for NativeBackend {
    type ThreadResources = SignalStack;

    fn initialize(&self) -> NceResult<()> {
        let result = INSTALL.get_or_init(install_handlers).clone();
        if let Err(err) = &result {
            warn!("Signal handler installation failed: {err}");
        }
        result
    }

    fn prepare_thread(&self, config: &NceConfig) -> NceResult<SignalStack> {
        let stack = SignalStack::new(config.signal_stack_size)?;
        stack.register()?;
        Ok(stack)
    }

    fn current_thread_id(&self) -> HostThreadId {
        signals::current_thread_id()
    }

    fn interrupt(&self, thread: HostThreadId) -> NceResult<()> {
        signals::deliver(thread, BREAK_FROM_GUEST_SIGNAL)
    }

    unsafe fn run_guest(&self, entry: GuestEntry<'_>) -> u64 {
        let control = entry.control().as_raw();
        // SAFETY: upheld by the caller; both transitions return through
        // `save_guest_context`, which restores the callee-saved registers.
        unsafe {
            match entry.path() {
                EntryPath::Trampoline(trampoline) => {
                    nce_return_to_run_code_by_trampoline(control, entry.guest_ptr(), trampoline)
                }
                EntryPath::ExceptionLevelChange => {
                    nce_return_to_run_code_by_exception_level_change(
                        entry.thread_id().raw(),
                        control,
                    )
                }
            }
        }
    }

    fn clear_instruction_cache(&self) {
        // EL0 没有 `ic iallu`，只能等待已发生的访问完成
        // SAFETY: barriers only.
        unsafe { asm!("dsb ish", "isb", options(nostack, preserves_flags)) };
    }
}
