//! 故障分发器
//!
//! 在执行线程上（通常在信号处理器内）处理客户机的未对齐访问和访问故障。
//! 可恢复的故障原地修正主机上下文后继续执行客户机；不可恢复的故障按
//! 取指/数据中止区分处理。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, warn};
use nce_core::{ControlBlock, GuestContext, GuestMemory, HaltReason, NceConfig};
use nce_mem::TranslationCache;
use nce_platform::{FaultInfo, HostContext};

use crate::interp;
use crate::switch;

const INSN_SIZE: u64 = 4;

/// 故障处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// 回到客户机继续执行
    Resume,
    /// 客户机状态已保存，控制权返回宿主
    ReturnToHost,
}

/// 故障统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// 未对齐访问被解释执行
    pub alignment_emulated: u64,
    /// 未对齐访问无法解码而被跳过
    pub alignment_skipped: u64,
    /// 访问故障通过插入 TLB 条目解决
    pub access_resolved: u64,
    /// 访问故障命中 TLB，视为已解决
    pub access_spurious: u64,
    /// 请求内存管理器重映射的次数
    pub remaps: u64,
    /// 被跳过的数据中止
    pub data_aborts_skipped: u64,
    /// 返回宿主的取指中止
    pub prefetch_aborts: u64,
}

#[derive(Default)]
struct FaultCounters {
    alignment_emulated: AtomicU64,
    alignment_skipped: AtomicU64,
    access_resolved: AtomicU64,
    access_spurious: AtomicU64,
    remaps: AtomicU64,
    data_aborts_skipped: AtomicU64,
    prefetch_aborts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// 故障分发器
pub struct FaultDispatcher {
    memory: Arc<dyn GuestMemory>,
    tlb: Arc<TranslationCache>,
    page_size: u64,
    retries: u32,
    counters: FaultCounters,
}

impl FaultDispatcher {
    pub fn new(memory: Arc<dyn GuestMemory>, tlb: Arc<TranslationCache>, config: &NceConfig) -> Self {
        Self {
            memory,
            tlb,
            page_size: config.guest_page_size,
            retries: config.access_fault_retries,
            counters: FaultCounters::default(),
        }
    }

    pub fn memory(&self) -> &Arc<dyn GuestMemory> {
        &self.memory
    }

    pub fn translation_cache(&self) -> &Arc<TranslationCache> {
        &self.tlb
    }

    /// 未对齐访问：解释执行故障指令；无法解码时跳过一条指令
    pub fn handle_alignment_fault(&self, ctx: &mut impl HostContext) -> FaultOutcome {
        let pc = ctx.pc();
        debug!("Alignment fault at pc {pc:#x}");

        match interp::execute_one(ctx, self.memory.as_ref()) {
            Some(next_pc) => {
                ctx.set_pc(next_pc);
                bump(&self.counters.alignment_emulated);
            }
            None => {
                debug!("Could not handle alignment fault at {pc:#x}, skipping instruction");
                ctx.set_pc(pc.wrapping_add(INSN_SIZE));
                bump(&self.counters.alignment_skipped);
            }
        }
        FaultOutcome::Resume
    }

    /// 访问故障：先查 TLB，再请求内存管理器刷新或重映射，受重试次数限制
    pub fn handle_access_fault(
        &self,
        guest: &mut GuestContext,
        control: &ControlBlock,
        ctx: &mut impl HostContext,
        fault: FaultInfo,
    ) -> FaultOutcome {
        let addr = fault.address;

        for _ in 0..self.retries {
            if let Some(entry) = self.tlb.lookup(addr) {
                if !entry.writable && fault.code.is_permission() {
                    debug!("Write to read-only memory at {addr:#x}");
                    return self.handle_failed_fault(guest, control, ctx, fault);
                }
                bump(&self.counters.access_spurious);
                return FaultOutcome::Resume;
            }

            if self.memory.invalidate_nce(addr, self.page_size) {
                if self.try_insert(addr) {
                    return FaultOutcome::Resume;
                }
                debug!("Failed to get host address for guest address {addr:#x}");
            } else {
                debug!("Memory invalidation failed for address {addr:#x}");
            }

            bump(&self.counters.remaps);
            if !self.memory.remap(addr, self.page_size) {
                error!("Immediate remap failed for address {addr:#x}");
                return self.handle_failed_fault(guest, control, ctx, fault);
            }
            if self.try_insert(addr) {
                return FaultOutcome::Resume;
            }
            error!("Failed to get host address after remap for guest address {addr:#x}");
        }

        self.handle_failed_fault(guest, control, ctx, fault)
    }

    fn try_insert(&self, addr: u64) -> bool {
        let Some(host) = self.memory.get_pointer(addr) else {
            return false;
        };
        let writable = self.memory.is_writable(addr);
        // 映射已经有效；插入被拒绝时下次故障重新走内存管理器
        if self
            .tlb
            .insert(addr, host.as_ptr() as u64, self.page_size, writable)
        {
            bump(&self.counters.access_resolved);
        }
        true
    }

    /// 不可恢复的故障
    ///
    /// 数据中止跳过故障指令继续执行；取指中止记录停机原因，强制持锁后返回宿主。
    pub fn handle_failed_fault(
        &self,
        guest: &mut GuestContext,
        control: &ControlBlock,
        ctx: &mut impl HostContext,
        fault: FaultInfo,
    ) -> FaultOutcome {
        let pc = ctx.pc();
        let is_prefetch_abort = pc == fault.address;

        if !is_prefetch_abort {
            warn!("Skipping data abort at pc {pc:#x} ({fault})");
            ctx.set_pc(pc.wrapping_add(INSN_SIZE));
            bump(&self.counters.data_aborts_skipped);
            return FaultOutcome::Resume;
        }

        warn!("Prefetch abort at pc {pc:#x}, returning to host");
        bump(&self.counters.prefetch_aborts);
        guest.halt.raise(HaltReason::PREFETCH_ABORT);
        // 可能与 signal_interrupt 竞争：输了则它发来的信号在我们离开客户机后被忽略，
        // 赢了则它会等到我们解锁。
        control.force_lock();
        switch::save_guest_context(guest, ctx);
        FaultOutcome::ReturnToHost
    }

    pub fn stats(&self) -> FaultStats {
        let c = &self.counters;
        FaultStats {
            alignment_emulated: c.alignment_emulated.load(Ordering::Relaxed),
            alignment_skipped: c.alignment_skipped.load(Ordering::Relaxed),
            access_resolved: c.access_resolved.load(Ordering::Relaxed),
            access_spurious: c.access_spurious.load(Ordering::Relaxed),
            remaps: c.remaps.load(Ordering::Relaxed),
            data_aborts_skipped: c.data_aborts_skipped.load(Ordering::Relaxed),
            prefetch_aborts: c.prefetch_aborts.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FaultDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultDispatcher")
            .field("page_size", &self.page_size)
            .field("retries", &self.retries)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingMemory;
    use nce_core::LockState;
    use nce_platform::{CapturedContext, FaultCode};

    const GUEST_BASE: u64 = 0x8000_0000;
    const HOST_LR: u64 = 0x5555_0010;

    struct Fixture {
        memory: Arc<RecordingMemory>,
        tlb: Arc<TranslationCache>,
        dispatcher: FaultDispatcher,
        guest: GuestContext,
        control: ControlBlock,
        ctx: CapturedContext,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let memory = Arc::new(RecordingMemory::new(GUEST_BASE, 0x4000));
        let tlb = Arc::new(TranslationCache::with_capacity(8));
        let config = NceConfig::default();
        let dispatcher = FaultDispatcher::new(memory.clone(), tlb.clone(), &config);
        let mut guest = GuestContext::new();
        guest.host_ctx.host_saved_regs[11] = HOST_LR;
        let mut ctx = CapturedContext::default();
        ctx.pc = GUEST_BASE + 0x100;
        Fixture {
            memory,
            tlb,
            dispatcher,
            guest,
            control: ControlBlock::new(),
            ctx,
        }
    }

    impl Fixture {
        fn access(&mut self, fault: FaultInfo) -> FaultOutcome {
            self.dispatcher
                .handle_access_fault(&mut self.guest, &self.control, &mut self.ctx, fault)
        }
    }

    #[test]
    fn test_unmapped_fault_resolves_with_one_insert() {
        let mut f = fixture();
        let addr = GUEST_BASE + 0x1234;

        assert_eq!(f.access(FaultInfo::unmapped(addr)), FaultOutcome::Resume);

        assert_eq!(f.tlb.len(), 1);
        assert_eq!(f.tlb.stats().inserts, 1);
        let entry = f.tlb.entries()[0];
        assert_eq!(entry.guest_addr, GUEST_BASE + 0x1000);
        assert_eq!(f.memory.remap_calls(), 0);
        assert_eq!(f.ctx.pc, GUEST_BASE + 0x100);
        assert_eq!(f.dispatcher.stats().access_resolved, 1);
    }

    #[test]
    fn test_rejected_insert_is_not_counted_as_resolved() {
        let memory = Arc::new(RecordingMemory::new(GUEST_BASE, 0x4000));
        let tlb = Arc::new(TranslationCache::with_capacity(8));
        let config = NceConfig {
            guest_page_size: 3000,
            ..NceConfig::default()
        };
        let dispatcher = FaultDispatcher::new(memory.clone(), tlb.clone(), &config);
        let mut guest = GuestContext::new();
        let control = ControlBlock::new();
        let mut ctx = CapturedContext::default();
        ctx.pc = GUEST_BASE + 0x100;

        let outcome = dispatcher.handle_access_fault(
            &mut guest,
            &control,
            &mut ctx,
            FaultInfo::unmapped(GUEST_BASE + 0x1234),
        );

        assert_eq!(outcome, FaultOutcome::Resume);
        assert!(tlb.is_empty());
        assert_eq!(tlb.stats().rejected, 1);
        assert_eq!(dispatcher.stats().access_resolved, 0);
        assert_eq!(ctx.pc, GUEST_BASE + 0x100);
    }

    #[test]
    fn test_repeat_access_hits_without_remap() {
        let mut f = fixture();
        let addr = GUEST_BASE + 0x2010;
        f.access(FaultInfo::unmapped(addr));
        let invalidations = f.memory.invalidate_calls();

        assert_eq!(f.access(FaultInfo::unmapped(addr + 8)), FaultOutcome::Resume);
        assert_eq!(f.memory.invalidate_calls(), invalidations);
        assert_eq!(f.memory.remap_calls(), 0);
        assert_eq!(f.dispatcher.stats().access_spurious, 1);
    }

    #[test]
    fn test_write_to_read_only_entry_is_unrecoverable() {
        let mut f = fixture();
        let addr = GUEST_BASE + 0x3000;
        f.tlb.insert(addr, 0xAAAA_0000, 4096, false);

        let outcome = f.access(FaultInfo::permission(addr));

        // pc != address: data abort, skipped
        assert_eq!(outcome, FaultOutcome::Resume);
        assert_eq!(f.ctx.pc, GUEST_BASE + 0x104);
        assert_eq!(f.memory.invalidate_calls(), 0);
        assert_eq!(f.memory.remap_calls(), 0);
        assert_eq!(f.dispatcher.stats().data_aborts_skipped, 1);
    }

    #[test]
    fn test_read_fault_on_read_only_entry_is_spurious() {
        let mut f = fixture();
        let addr = GUEST_BASE + 0x3000;
        f.tlb.insert(addr, 0xAAAA_0000, 4096, false);

        assert_eq!(f.access(FaultInfo::unmapped(addr)), FaultOutcome::Resume);
        assert_eq!(f.ctx.pc, GUEST_BASE + 0x100);
    }

    #[test]
    fn test_remap_recovers_missing_pointer() {
        let mut f = fixture();
        f.memory.set_pointer_available(false);
        f.memory.set_remap_restores_pointer(true);

        assert_eq!(f.access(FaultInfo::unmapped(GUEST_BASE + 0x10)), FaultOutcome::Resume);
        assert_eq!(f.memory.remap_calls(), 1);
        assert_eq!(f.tlb.len(), 1);
    }

    #[test]
    fn test_exhausted_retries_fail_exactly_once() {
        let mut f = fixture();
        f.memory.set_invalidate_result(false);
        f.memory.set_pointer_available(false);
        let addr = GUEST_BASE + 0x100;

        // instruction fetch from the faulting page: prefetch abort
        let outcome = f.access(FaultInfo::unmapped(addr));

        assert_eq!(outcome, FaultOutcome::ReturnToHost);
        assert_eq!(f.memory.remap_calls(), 3);
        assert_eq!(f.memory.invalidate_calls(), 3);
        let stats = f.dispatcher.stats();
        assert_eq!(stats.prefetch_aborts, 1);
        assert_eq!(stats.data_aborts_skipped, 0);
        assert!(f.tlb.is_empty());
    }

    #[test]
    fn test_failed_remap_short_circuits() {
        let mut f = fixture();
        f.memory.set_invalidate_result(false);
        f.memory.set_remap_result(false);

        let outcome = f.access(FaultInfo::unmapped(GUEST_BASE + 0x2000));

        assert_eq!(outcome, FaultOutcome::Resume);
        assert_eq!(f.memory.remap_calls(), 1);
        assert_eq!(f.dispatcher.stats().data_aborts_skipped, 1);
        assert_eq!(f.ctx.pc, GUEST_BASE + 0x104);
    }

    #[test]
    fn test_prefetch_abort_returns_to_host_locked() {
        let mut f = fixture();
        f.memory.set_invalidate_result(false);
        f.memory.set_remap_result(false);
        f.ctx.regs[5] = 55;
        let addr = f.ctx.pc;

        let outcome = f.access(FaultInfo::new(addr, FaultCode::Permission));

        assert_eq!(outcome, FaultOutcome::ReturnToHost);
        assert_eq!(f.control.lock_state(), LockState::Locked);
        assert_eq!(f.guest.pc, addr);
        assert_eq!(f.guest.cpu_registers[5], 55);
        assert_eq!(f.ctx.pc, HOST_LR);
        assert_eq!(f.ctx.regs[0], HaltReason::PREFETCH_ABORT.bits());
    }

    #[test]
    fn test_alignment_fault_emulates_or_skips() {
        let f = fixture();
        let pc = GUEST_BASE + 0x200;
        // ldr x0, [x1, #8]
        f.memory.write(pc, &0xF940_0420u32.to_le_bytes());
        f.memory.write(GUEST_BASE + 0x309, &99u64.to_le_bytes());
        let mut ctx = CapturedContext::default();
        ctx.pc = pc;
        ctx.regs[1] = GUEST_BASE + 0x301;

        assert_eq!(f.dispatcher.handle_alignment_fault(&mut ctx), FaultOutcome::Resume);
        assert_eq!(ctx.regs[0], 99);
        assert_eq!(ctx.pc, pc + 4);

        // add x0, x0, #1 cannot be emulated
        f.memory.write(pc + 4, &0x9100_0400u32.to_le_bytes());
        assert_eq!(f.dispatcher.handle_alignment_fault(&mut ctx), FaultOutcome::Resume);
        assert_eq!(ctx.pc, pc + 8);
        assert_eq!(ctx.regs[0], 99);

        let stats = f.dispatcher.stats();
        assert_eq!(stats.alignment_emulated, 1);
        assert_eq!(stats.alignment_skipped, 1);
    }
}
