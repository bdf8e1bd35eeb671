//! 上下文切换协议
//!
//! 三个转换都只通过 [`HostContext`] 操作陷入时保存的主机上下文：
//! - [`restore_guest_context`]：宿主 -> 客户机，保存宿主被调用者保存寄存器并装入客户机状态；
//! - [`resume_guest_context`]：可恢复故障后重新装入客户机状态，不触碰宿主保存区；
//! - [`save_guest_context`]：客户机 -> 宿主，保存客户机状态，恢复宿主寄存器并返回停机原因。

use nce_core::{ControlBlock, GuestContext, HaltReason, HostSaveArea, NUM_GPRS, NUM_VREGS};
use nce_platform::HostContext;

/// x19 是第一个宿主被调用者保存寄存器
const FIRST_CALLEE_SAVED_GPR: usize = 19;
/// q8..q15 的低 64 位由调用约定保存，这里保存完整的 128 位
const FIRST_CALLEE_SAVED_VREG: usize = 8;

fn load_guest_state(guest: &GuestContext, ctx: &mut impl HostContext) {
    for (index, value) in guest.cpu_registers.iter().enumerate() {
        ctx.set_gpr(index, *value);
    }
    ctx.set_sp(guest.sp);
    ctx.set_pc(guest.pc);
    ctx.set_pstate(u64::from(guest.pstate));
    ctx.set_fpcr(guest.fpcr);
    ctx.set_fpsr(guest.fpsr);
    for (index, value) in guest.vector_registers.iter().enumerate() {
        ctx.set_vreg(index, *value);
    }
}

/// 进入客户机
///
/// `tpidr_el0` 不在这里处理，由陷入胶水代码负责。
pub fn restore_guest_context(guest: &mut GuestContext, ctx: &mut impl HostContext) {
    let host = &mut guest.host_ctx;
    for (i, slot) in host.host_saved_regs.iter_mut().enumerate() {
        *slot = ctx.gpr(FIRST_CALLEE_SAVED_GPR + i);
    }
    for (i, slot) in host.host_saved_vregs.iter_mut().enumerate() {
        *slot = ctx.vreg(FIRST_CALLEE_SAVED_VREG + i);
    }
    host.host_sp = ctx.sp();

    load_guest_state(guest, ctx);
}

/// 在陷入处理器内重新装入客户机状态
pub fn resume_guest_context(guest: &GuestContext, ctx: &mut impl HostContext) {
    load_guest_state(guest, ctx);
}

/// 返回宿主
///
/// 之后 `ctx` 从 `run_thread` 调用点的返回地址继续执行，`x0` 是取走的停机原因。
pub fn save_guest_context(guest: &mut GuestContext, ctx: &mut impl HostContext) {
    for index in 0..NUM_GPRS {
        guest.cpu_registers[index] = ctx.gpr(index);
    }
    guest.sp = ctx.sp();
    guest.pc = ctx.pc();
    guest.pstate = ctx.pstate() as u32;
    guest.fpcr = ctx.fpcr();
    guest.fpsr = ctx.fpsr();
    for index in 0..NUM_VREGS {
        guest.vector_registers[index] = ctx.vreg(index);
    }

    let host = &guest.host_ctx;
    ctx.set_sp(host.host_sp);
    for (i, value) in host.host_saved_regs.iter().enumerate() {
        ctx.set_gpr(FIRST_CALLEE_SAVED_GPR + i, *value);
    }
    for (i, value) in host.host_saved_vregs.iter().enumerate() {
        ctx.set_vreg(FIRST_CALLEE_SAVED_VREG + i, *value);
    }
    ctx.set_pc(host.host_saved_regs[HostSaveArea::LINK_REGISTER]);
    ctx.set_gpr(0, guest.halt.take().bits());
}

/// 客户机发起的系统调用
///
/// 记录调用号，跳过 `svc` 指令，强制持锁后返回宿主。
pub fn trap_supervisor_call(
    guest: &mut GuestContext,
    control: &ControlBlock,
    ctx: &mut impl HostContext,
    svc: u32,
) {
    guest.svc = svc;
    ctx.set_pc(ctx.pc().wrapping_add(4));
    guest.halt.raise(HaltReason::SUPERVISOR_CALL);
    control.force_lock();
    save_guest_context(guest, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nce_core::LockState;
    use nce_platform::CapturedContext;

    const HOST_SP: u64 = 0x7FFF_F000;
    const HOST_LR: u64 = 0x5555_1234;

    fn host_call_site() -> CapturedContext {
        let mut ctx = CapturedContext::default();
        for i in 0..31 {
            ctx.regs[i] = 0xC000 + i as u64;
        }
        ctx.regs[30] = HOST_LR;
        for i in 0..32 {
            ctx.vregs[i] = 0xD000 + i as u128;
        }
        ctx.sp = HOST_SP;
        ctx.pc = 0x5555_0000;
        ctx
    }

    fn guest_state() -> GuestContext {
        let mut guest = GuestContext::new();
        for i in 0..31 {
            guest.cpu_registers[i] = 0x1_0000 + i as u64;
        }
        for i in 0..32 {
            guest.vector_registers[i] = (0xAB_u128 << 64) | i as u128;
        }
        guest.sp = 0x2000_0000;
        guest.pc = 0x8000_0000;
        guest.pstate = 0x6000_0000;
        guest.fpcr = 0x0300_0000;
        guest.fpsr = 0x1F;
        guest
    }

    #[test]
    fn test_enter_parks_host_and_loads_guest() {
        let mut guest = guest_state();
        let mut ctx = host_call_site();

        restore_guest_context(&mut guest, &mut ctx);

        assert_eq!(guest.host_ctx.host_sp, HOST_SP);
        assert_eq!(guest.host_ctx.host_saved_regs[0], 0xC000 + 19);
        assert_eq!(guest.host_ctx.return_address(), HOST_LR);
        assert_eq!(guest.host_ctx.host_saved_vregs[0], 0xD000 + 8);
        assert_eq!(ctx.pc, 0x8000_0000);
        assert_eq!(ctx.sp, 0x2000_0000);
        assert_eq!(ctx.regs[19], 0x1_0000 + 19);
        assert_eq!(ctx.vregs[31], (0xAB_u128 << 64) | 31);
        assert_eq!(ctx.fpcr, 0x0300_0000);
    }

    #[test]
    fn test_enter_then_trap_round_trips_everything() {
        let mut guest = guest_state();
        let expected = guest.thread_context();
        let mut ctx = host_call_site();
        let host_before = ctx;

        restore_guest_context(&mut guest, &mut ctx);
        guest.halt.raise(HaltReason::BREAK_LOOP);
        save_guest_context(&mut guest, &mut ctx);

        assert_eq!(guest.thread_context(), expected);
        assert_eq!(ctx.pc, HOST_LR);
        assert_eq!(ctx.sp, HOST_SP);
        assert_eq!(ctx.regs[0], HaltReason::BREAK_LOOP.bits());
        assert_eq!(&ctx.regs[19..], &host_before.regs[19..]);
        assert_eq!(&ctx.vregs[8..16], &host_before.vregs[8..16]);
        assert!(guest.halt.peek().is_empty());
    }

    #[test]
    fn test_trap_captures_guest_progress() {
        let mut guest = guest_state();
        let mut ctx = host_call_site();
        restore_guest_context(&mut guest, &mut ctx);

        ctx.regs[3] = 42;
        ctx.pc += 0x40;
        ctx.vregs[2] = 7;
        save_guest_context(&mut guest, &mut ctx);

        assert_eq!(guest.cpu_registers[3], 42);
        assert_eq!(guest.pc, 0x8000_0040);
        assert_eq!(guest.vector_registers[2], 7);
    }

    #[test]
    fn test_resume_leaves_host_area_alone() {
        let mut guest = guest_state();
        let mut ctx = host_call_site();
        restore_guest_context(&mut guest, &mut ctx);
        let parked = guest.host_ctx;

        let mut fault_ctx = CapturedContext::default();
        resume_guest_context(&guest, &mut fault_ctx);

        assert_eq!(guest.host_ctx, parked);
        assert_eq!(fault_ctx.pc, guest.pc);
        assert_eq!(fault_ctx.regs[7], guest.cpu_registers[7]);
    }

    #[test]
    fn test_supervisor_call_forces_lock_and_skips_svc() {
        let mut guest = guest_state();
        let control = ControlBlock::new();
        let mut ctx = host_call_site();
        restore_guest_context(&mut guest, &mut ctx);

        trap_supervisor_call(&mut guest, &control, &mut ctx, 0x26);

        assert_eq!(guest.svc, 0x26);
        assert_eq!(guest.pc, 0x8000_0004);
        assert_eq!(control.lock_state(), LockState::Locked);
        assert_eq!(ctx.regs[0], HaltReason::SUPERVISOR_CALL.bits());
        assert_eq!(ctx.pc, HOST_LR);
    }
}
