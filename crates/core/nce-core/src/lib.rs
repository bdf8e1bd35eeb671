//! nce-core: 原生代码执行的核心数据结构
//!
//! 客户机寄存器文件、每线程控制块（含自旋锁）、停机原因位掩码、
//! 内核可见的线程上下文、内存管理器接口、配置与错误类型。

pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod halt;
pub mod memory;
mod sync;

pub use config::{MIN_SIGNAL_STACK_SIZE, NceConfig};
pub use context::{GuestContext, HostSaveArea, NUM_GPRS, NUM_SVC_ARGS, NUM_VREGS, ThreadContext};
pub use control::{CONTROL_BLOCK_MAGIC, ControlBlock, LockState, SpinLock};
pub use error::{NceError, NceResult};
pub use halt::{HaltReason, HaltReasonCell};
pub use memory::{GUEST_PAGE_SIZE, GuestMemory};

// ============================================================================
// 汇编可见的字段偏移
// ============================================================================

/// Byte offsets of the fields the trap glue touches.
pub mod offsets {
    use std::mem::offset_of;

    use crate::context::{GuestContext, HostSaveArea};
    use crate::control::ControlBlock;

    pub const GUEST_CPU_REGISTERS: usize = offset_of!(GuestContext, cpu_registers);
    pub const GUEST_SP: usize = offset_of!(GuestContext, sp);
    pub const GUEST_PC: usize = offset_of!(GuestContext, pc);
    pub const GUEST_FPCR: usize = offset_of!(GuestContext, fpcr);
    pub const GUEST_FPSR: usize = offset_of!(GuestContext, fpsr);
    pub const GUEST_VECTOR_REGISTERS: usize = offset_of!(GuestContext, vector_registers);
    pub const GUEST_PSTATE: usize = offset_of!(GuestContext, pstate);

    pub const GUEST_HOST_SAVED_REGS: usize =
        offset_of!(GuestContext, host_ctx) + offset_of!(HostSaveArea, host_saved_regs);
    pub const GUEST_HOST_SAVED_VREGS: usize =
        offset_of!(GuestContext, host_ctx) + offset_of!(HostSaveArea, host_saved_vregs);
    pub const GUEST_HOST_SP: usize =
        offset_of!(GuestContext, host_ctx) + offset_of!(HostSaveArea, host_sp);
    pub const GUEST_HOST_TPIDR_EL0: usize =
        offset_of!(GuestContext, host_ctx) + offset_of!(HostSaveArea, host_tpidr_el0);

    pub const CONTROL_TPIDR_EL0: usize = offset_of!(ControlBlock, tpidr_el0);
    pub const CONTROL_NATIVE_CONTEXT: usize = offset_of!(ControlBlock, native_context);
    pub const CONTROL_LOCK: usize = offset_of!(ControlBlock, lock);
    pub const CONTROL_IS_RUNNING: usize = offset_of!(ControlBlock, is_running);
    pub const CONTROL_MAGIC: usize = offset_of!(ControlBlock, magic);
}
