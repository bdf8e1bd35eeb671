//! Guest register file and the kernel-facing thread context.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::halt::HaltReasonCell;

/// Number of general purpose registers x0..x30.
pub const NUM_GPRS: usize = 31;
/// Number of SIMD&FP registers v0..v31.
pub const NUM_VREGS: usize = 32;
/// Registers carrying supervisor-call arguments and results (x0..x7).
pub const NUM_SVC_ARGS: usize = 8;

/// Host state preserved across a stay in guest mode.
///
/// `host_saved_regs` holds x19..x30 in order, so index 10 is the frame pointer
/// and index 11 the link register the trap path resumes at.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostSaveArea {
    pub host_saved_regs: [u64; 12],
    pub host_saved_vregs: [u128; 8],
    pub host_sp: u64,
    pub host_tpidr_el0: u64,
}

impl HostSaveArea {
    /// Index of x30 inside `host_saved_regs`.
    pub const LINK_REGISTER: usize = 11;

    pub fn return_address(&self) -> u64 {
        self.host_saved_regs[Self::LINK_REGISTER]
    }
}

/// Complete AArch64 register state of the guest thread bound to an engine.
///
/// The trap glue addresses this structure by offset, see [`crate::offsets`].
#[repr(C)]
pub struct GuestContext {
    pub cpu_registers: [u64; NUM_GPRS],
    pub sp: u64,
    pub pc: u64,
    pub fpcr: u32,
    pub fpsr: u32,
    pub vector_registers: [u128; NUM_VREGS],
    pub pstate: u32,
    /// Immediate of the last supervisor call.
    pub svc: u32,
    pub halt: Arc<HaltReasonCell>,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,
    pub host_ctx: HostSaveArea,
}

impl GuestContext {
    pub fn new() -> Self {
        Self::with_halt(Arc::new(HaltReasonCell::new()))
    }

    /// Builds a register file that reports into an existing halt cell.
    pub fn with_halt(halt: Arc<HaltReasonCell>) -> Self {
        Self {
            cpu_registers: [0; NUM_GPRS],
            sp: 0,
            pc: 0,
            fpcr: 0,
            fpsr: 0,
            vector_registers: [0; NUM_VREGS],
            pstate: 0,
            svc: 0,
            halt,
            tpidr_el0: 0,
            tpidrro_el0: 0,
            host_ctx: HostSaveArea::default(),
        }
    }

    pub fn halt(&self) -> &HaltReasonCell {
        &self.halt
    }

    pub fn halt_handle(&self) -> Arc<HaltReasonCell> {
        Arc::clone(&self.halt)
    }

    /// Reads a general purpose register; index 31 reads as zero.
    pub fn gpr(&self, index: usize) -> u64 {
        self.cpu_registers.get(index).copied().unwrap_or(0)
    }

    pub fn set_gpr(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.cpu_registers.get_mut(index) {
            *slot = value;
        }
    }

    pub fn svc_arguments(&self) -> [u64; NUM_SVC_ARGS] {
        let mut args = [0; NUM_SVC_ARGS];
        args.copy_from_slice(&self.cpu_registers[..NUM_SVC_ARGS]);
        args
    }

    pub fn set_svc_arguments(&mut self, args: &[u64; NUM_SVC_ARGS]) {
        self.cpu_registers[..NUM_SVC_ARGS].copy_from_slice(args);
    }

    /// Exports the architectural state.
    pub fn thread_context(&self) -> ThreadContext {
        let mut r = [0; 29];
        r.copy_from_slice(&self.cpu_registers[..29]);
        ThreadContext {
            r,
            fp: self.cpu_registers[29],
            lr: self.cpu_registers[30],
            sp: self.sp,
            pc: self.pc,
            pstate: self.pstate,
            v: self.vector_registers,
            fpcr: self.fpcr,
            fpsr: self.fpsr,
            tpidr: self.tpidr_el0,
        }
    }

    /// Replaces the architectural state. Host save area, halt cell and
    /// `tpidrro_el0` are untouched.
    pub fn load_thread_context(&mut self, ctx: &ThreadContext) {
        self.cpu_registers[..29].copy_from_slice(&ctx.r);
        self.cpu_registers[29] = ctx.fp;
        self.cpu_registers[30] = ctx.lr;
        self.sp = ctx.sp;
        self.pc = ctx.pc;
        self.pstate = ctx.pstate;
        self.vector_registers = ctx.v;
        self.fpcr = ctx.fpcr;
        self.fpsr = ctx.fpsr;
        self.tpidr_el0 = ctx.tpidr;
    }
}

impl Default for GuestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GuestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestContext")
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("pstate", &format_args!("{:#x}", self.pstate))
            .field("svc", &self.svc)
            .field("halt", &self.halt)
            .field("tpidr_el0", &format_args!("{:#x}", self.tpidr_el0))
            .field("tpidrro_el0", &format_args!("{:#x}", self.tpidrro_el0))
            .finish_non_exhaustive()
    }
}

/// Thread context exchanged with the guest kernel and debuggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadContext {
    pub r: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub pstate: u32,
    pub v: [u128; NUM_VREGS],
    pub fpcr: u32,
    pub fpsr: u32,
    pub tpidr: u64,
}
