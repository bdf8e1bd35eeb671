//! 信号处理器中的主机执行上下文
//!
//! 上下文切换与故障处理只通过 [`HostContext`] 读写寄存器，
//! 真正触碰 `ucontext_t` 的代码只有 [`UcontextView`]。

use nce_core::{GuestContext, NUM_GPRS, NUM_VREGS};

/// 陷入时保存的 AArch64 寄存器状态
///
/// `gpr` 的索引范围是 0..=30；越界读返回 0，越界写被忽略。
pub trait HostContext {
    fn gpr(&self, index: usize) -> u64;
    fn set_gpr(&mut self, index: usize, value: u64);

    fn sp(&self) -> u64;
    fn set_sp(&mut self, value: u64);

    fn pc(&self) -> u64;
    fn set_pc(&mut self, value: u64);

    fn pstate(&self) -> u64;
    fn set_pstate(&mut self, value: u64);

    fn fpcr(&self) -> u32;
    fn set_fpcr(&mut self, value: u32);

    fn fpsr(&self) -> u32;
    fn set_fpsr(&mut self, value: u32);

    fn vreg(&self, index: usize) -> u128;
    fn set_vreg(&mut self, index: usize, value: u128);

    /// 按指令编码语义读通用寄存器：31 号为 XZR
    fn xreg_or_zero(&self, index: usize) -> u64 {
        if index == 31 { 0 } else { self.gpr(index) }
    }

    /// 按指令编码语义读基址寄存器：31 号为 SP
    fn xreg_or_sp(&self, index: usize) -> u64 {
        if index == 31 { self.sp() } else { self.gpr(index) }
    }

    fn set_xreg_or_sp(&mut self, index: usize, value: u64) {
        if index == 31 {
            self.set_sp(value);
        } else {
            self.set_gpr(index, value);
        }
    }
}

// ============================================================================
// 纯数据上下文
// ============================================================================

/// 与主机无关的寄存器快照，用于脚本化后端和测试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedContext {
    pub regs: [u64; NUM_GPRS],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub fpcr: u32,
    pub fpsr: u32,
    pub vregs: [u128; NUM_VREGS],
}

impl Default for CapturedContext {
    fn default() -> Self {
        Self {
            regs: [0; NUM_GPRS],
            sp: 0,
            pc: 0,
            pstate: 0,
            fpcr: 0,
            fpsr: 0,
            vregs: [0; NUM_VREGS],
        }
    }
}

impl HostContext for CapturedContext {
    fn gpr(&self, index: usize) -> u64 {
        self.regs.get(index).copied().unwrap_or(0)
    }
    fn set_gpr(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.regs.get_mut(index) {
            *slot = value;
        }
    }
    fn sp(&self) -> u64 {
        self.sp
    }
    fn set_sp(&mut self, value: u64) {
        self.sp = value;
    }
    fn pc(&self) -> u64 {
        self.pc
    }
    fn set_pc(&mut self, value: u64) {
        self.pc = value;
    }
    fn pstate(&self) -> u64 {
        self.pstate
    }
    fn set_pstate(&mut self, value: u64) {
        self.pstate = value;
    }
    fn fpcr(&self) -> u32 {
        self.fpcr
    }
    fn set_fpcr(&mut self, value: u32) {
        self.fpcr = value;
    }
    fn fpsr(&self) -> u32 {
        self.fpsr
    }
    fn set_fpsr(&mut self, value: u32) {
        self.fpsr = value;
    }
    fn vreg(&self, index: usize) -> u128 {
        self.vregs.get(index).copied().unwrap_or(0)
    }
    fn set_vreg(&mut self, index: usize, value: u128) {
        if let Some(slot) = self.vregs.get_mut(index) {
            *slot = value;
        }
    }
}

// 单步解释执行直接作用于客户机寄存器文件
impl HostContext for GuestContext {
    fn gpr(&self, index: usize) -> u64 {
        GuestContext::gpr(self, index)
    }
    fn set_gpr(&mut self, index: usize, value: u64) {
        GuestContext::set_gpr(self, index, value);
    }
    fn sp(&self) -> u64 {
        self.sp
    }
    fn set_sp(&mut self, value: u64) {
        self.sp = value;
    }
    fn pc(&self) -> u64 {
        self.pc
    }
    fn set_pc(&mut self, value: u64) {
        self.pc = value;
    }
    fn pstate(&self) -> u64 {
        u64::from(self.pstate)
    }
    fn set_pstate(&mut self, value: u64) {
        self.pstate = value as u32;
    }
    fn fpcr(&self) -> u32 {
        self.fpcr
    }
    fn set_fpcr(&mut self, value: u32) {
        self.fpcr = value;
    }
    fn fpsr(&self) -> u32 {
        self.fpsr
    }
    fn set_fpsr(&mut self, value: u32) {
        self.fpsr = value;
    }
    fn vreg(&self, index: usize) -> u128 {
        self.vector_registers.get(index).copied().unwrap_or(0)
    }
    fn set_vreg(&mut self, index: usize, value: u128) {
        if let Some(slot) = self.vector_registers.get_mut(index) {
            *slot = value;
        }
    }
}

// ============================================================================
// Linux AArch64 ucontext
// ============================================================================

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub use self::ucontext::UcontextView;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod ucontext {
    use std::ffi::c_void;
    use std::marker::PhantomData;
    use std::mem::size_of;
    use std::ptr;

    use super::HostContext;

    /// `struct fpsimd_context` 的标识
    pub(crate) const FPSIMD_MAGIC: u32 = 0x4650_8001;
    /// `sigcontext.__reserved` 的大小
    const RESERVED_SIZE: usize = 4096;

    #[repr(C)]
    pub(crate) struct RecordHeader {
        pub(crate) magic: u32,
        pub(crate) size: u32,
    }

    #[repr(C)]
    pub(crate) struct FpsimdContext {
        pub(crate) head: RecordHeader,
        pub(crate) fpsr: u32,
        pub(crate) fpcr: u32,
        pub(crate) vregs: [u128; 32],
    }

    /// 信号处理器收到的 `ucontext_t` 的可写视图
    pub struct UcontextView<'a> {
        mcontext: *mut libc::mcontext_t,
        fpsimd: *mut FpsimdContext,
        _marker: PhantomData<&'a mut libc::ucontext_t>,
    }

    /// `__reserved` 紧跟在 `pstate` 之后，按 16 字节对齐
    pub(crate) unsafe fn reserved_area(mcontext: *mut libc::mcontext_t) -> *mut u8 {
        // SAFETY: caller passes a valid mcontext; the result stays inside it.
        unsafe {
            let end = ptr::addr_of_mut!((*mcontext).pstate).cast::<u8>().add(8);
            end.add(end.align_offset(16))
        }
    }

    unsafe fn find_fpsimd(mcontext: *mut libc::mcontext_t) -> *mut FpsimdContext {
        // SAFETY: records are laid out back to back inside the reserved area
        // and terminated by a zero header.
        unsafe {
            let reserved = reserved_area(mcontext);
            let mut offset = 0usize;
            while offset + size_of::<RecordHeader>() <= RESERVED_SIZE {
                let head = reserved.add(offset).cast::<RecordHeader>();
                let magic = (*head).magic;
                let size = (*head).size as usize;
                if magic == FPSIMD_MAGIC {
                    return head.cast();
                }
                if magic == 0 || size == 0 {
                    break;
                }
                offset += size;
            }
            ptr::null_mut()
        }
    }

    impl UcontextView<'_> {
        /// # Safety
        ///
        /// `raw` must be the `ucontext_t` argument of an `SA_SIGINFO` handler
        /// and must outlive the view.
        pub unsafe fn from_raw(raw: *mut c_void) -> Self {
            let uc = raw.cast::<libc::ucontext_t>();
            // SAFETY: upheld by the caller.
            let mcontext = unsafe { ptr::addr_of_mut!((*uc).uc_mcontext) };
            let fpsimd = unsafe { find_fpsimd(mcontext) };
            Self {
                mcontext,
                fpsimd,
                _marker: PhantomData,
            }
        }

        pub fn fault_address(&self) -> u64 {
            unsafe { (*self.mcontext).fault_address }
        }

        pub fn has_fpsimd(&self) -> bool {
            !self.fpsimd.is_null()
        }
    }

    impl HostContext for UcontextView<'_> {
        fn gpr(&self, index: usize) -> u64 {
            if index < 31 {
                unsafe { (*self.mcontext).regs[index] }
            } else {
                0
            }
        }
        fn set_gpr(&mut self, index: usize, value: u64) {
            if index < 31 {
                unsafe { (*self.mcontext).regs[index] = value };
            }
        }
        fn sp(&self) -> u64 {
            unsafe { (*self.mcontext).sp }
        }
        fn set_sp(&mut self, value: u64) {
            unsafe { (*self.mcontext).sp = value };
        }
        fn pc(&self) -> u64 {
            unsafe { (*self.mcontext).pc }
        }
        fn set_pc(&mut self, value: u64) {
            unsafe { (*self.mcontext).pc = value };
        }
        fn pstate(&self) -> u64 {
            unsafe { (*self.mcontext).pstate }
        }
        fn set_pstate(&mut self, value: u64) {
            unsafe { (*self.mcontext).pstate = value };
        }
        fn fpcr(&self) -> u32 {
            if self.fpsimd.is_null() { 0 } else { unsafe { (*self.fpsimd).fpcr } }
        }
        fn set_fpcr(&mut self, value: u32) {
            if !self.fpsimd.is_null() {
                unsafe { (*self.fpsimd).fpcr = value };
            }
        }
        fn fpsr(&self) -> u32 {
            if self.fpsimd.is_null() { 0 } else { unsafe { (*self.fpsimd).fpsr } }
        }
        fn set_fpsr(&mut self, value: u32) {
            if !self.fpsimd.is_null() {
                unsafe { (*self.fpsimd).fpsr = value };
            }
        }
        fn vreg(&self, index: usize) -> u128 {
            if self.fpsimd.is_null() || index >= 32 {
                0
            } else {
                unsafe { (*self.fpsimd).vregs[index] }
            }
        }
        fn set_vreg(&mut self, index: usize, value: u128) {
            if !self.fpsimd.is_null() && index < 32 {
                unsafe { (*self.fpsimd).vregs[index] = value };
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(ctx: &mut impl HostContext) {
        ctx.set_gpr(0, 1);
        ctx.set_gpr(30, 2);
        ctx.set_gpr(31, 3);
        ctx.set_sp(0x7000);
        ctx.set_vreg(5, 0xFF << 64);
        assert_eq!(ctx.gpr(0), 1);
        assert_eq!(ctx.gpr(30), 2);
        assert_eq!(ctx.gpr(31), 0);
        assert_eq!(ctx.xreg_or_zero(31), 0);
        assert_eq!(ctx.xreg_or_sp(31), 0x7000);
        assert_eq!(ctx.vreg(5), 0xFF << 64);
        ctx.set_xreg_or_sp(31, 0x6FF0);
        assert_eq!(ctx.sp(), 0x6FF0);
    }

    #[test]
    fn test_captured_context_register_access() {
        exercise(&mut CapturedContext::default());
    }

    #[test]
    fn test_guest_context_register_access() {
        let mut guest = GuestContext::new();
        exercise(&mut guest);
        guest.set_pstate(0x1_2000_0000);
        assert_eq!(guest.pstate, 0x2000_0000);
    }
}
