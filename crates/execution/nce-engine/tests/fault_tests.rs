//! 客户机故障经由运行循环的端到端测试

use std::sync::Arc;

use nce_core::{GuestMemory, LockState};
use nce_engine::testing::{GuestEvent, RecordingMemory, ScriptedBackend};
use nce_engine::{GuestThread, GuestThreadState, HaltReason, NativeEngine, NceConfig};
use nce_platform::FaultCode;

const BASE: u64 = 0x1_0000_0000;

struct Harness {
    engine: NativeEngine<ScriptedBackend>,
    backend: Arc<ScriptedBackend>,
    memory: Arc<RecordingMemory>,
    thread: GuestThreadState,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(ScriptedBackend::new());
    let memory = Arc::new(RecordingMemory::new(BASE, 0x10000));
    let config = NceConfig {
        enable_maintenance: false,
        tlb_capacity: 16,
        ..NceConfig::default()
    };
    let mut engine =
        NativeEngine::with_backend(0, memory.clone(), config, Arc::clone(&backend)).unwrap();
    engine.initialize().unwrap();
    engine.guest_mut().pc = BASE + 0x400;
    Harness {
        engine,
        backend,
        memory,
        thread: GuestThreadState::default(),
    }
}

impl Harness {
    fn run(&mut self, events: impl IntoIterator<Item = GuestEvent>) -> HaltReason {
        self.backend.script(events);
        self.engine.run_thread(&self.thread).unwrap()
    }
}

#[test]
fn test_access_fault_is_resolved_in_place() {
    let mut h = harness();

    let reason = h.run([
        GuestEvent::access_fault(BASE + 0x2345),
        GuestEvent::SupervisorCall(1),
    ]);

    assert_eq!(reason, HaltReason::SUPERVISOR_CALL);
    assert_eq!(h.engine.guest().pc, BASE + 0x404);
    assert_eq!(h.engine.tlb().len(), 1);
    assert_eq!(h.memory.remap_calls(), 0);
    assert_eq!(h.engine.fault_stats().access_resolved, 1);

    // 同一页的后续故障直接命中
    h.run([
        GuestEvent::access_fault(BASE + 0x2FF8),
        GuestEvent::SupervisorCall(1),
    ]);
    assert_eq!(h.memory.invalidate_calls(), 1);
    assert_eq!(h.engine.fault_stats().access_spurious, 1);
}

#[test]
fn test_read_only_page_write_is_skipped() {
    let mut h = harness();
    h.memory.set_writable(false);

    h.run([
        GuestEvent::access_fault(BASE + 0x3000),
        GuestEvent::AccessFault {
            address: BASE + 0x3008,
            code: FaultCode::Permission,
        },
        GuestEvent::SupervisorCall(2),
    ]);

    let stats = h.engine.fault_stats();
    assert_eq!(stats.access_resolved, 1);
    assert_eq!(stats.data_aborts_skipped, 1);
    assert_eq!(h.memory.remap_calls(), 0);
    // 跳过的存储指令 + svc
    assert_eq!(h.engine.guest().pc, BASE + 0x408);
}

#[test]
fn test_unresolvable_data_abort_skips_instruction() {
    let mut h = harness();
    h.memory.set_invalidate_result(false);
    h.memory.set_pointer_available(false);

    let reason = h.run([
        GuestEvent::access_fault(BASE + 0x9000),
        GuestEvent::SupervisorCall(3),
    ]);

    assert_eq!(reason, HaltReason::SUPERVISOR_CALL);
    assert_eq!(h.memory.remap_calls(), 3);
    assert_eq!(h.engine.fault_stats().data_aborts_skipped, 1);
    assert_eq!(h.engine.guest().pc, BASE + 0x408);
    assert!(h.engine.tlb().is_empty());
}

#[test]
fn test_prefetch_abort_returns_to_host() {
    let mut h = harness();
    h.memory.set_invalidate_result(false);
    h.memory.set_remap_result(false);

    let reason = h.run([GuestEvent::access_fault(BASE + 0x400)]);

    assert_eq!(reason, HaltReason::PREFETCH_ABORT);
    assert_eq!(h.engine.guest().pc, BASE + 0x400);
    assert_eq!(h.engine.fault_stats().prefetch_aborts, 1);
    assert_eq!(h.thread.control_block().lock_state(), LockState::Unlocked);
    assert!(!h.thread.control_block().is_running());

    // 宿主修复映射后可以重新进入
    h.memory.set_invalidate_result(true);
    let reason = h.run([
        GuestEvent::access_fault(BASE + 0x400),
        GuestEvent::SupervisorCall(4),
    ]);
    assert_eq!(reason, HaltReason::SUPERVISOR_CALL);
    assert_eq!(h.engine.guest().pc, BASE + 0x404);
}

#[test]
fn test_alignment_fault_is_emulated() {
    let mut h = harness();
    // ldp x6, x7, [x16, #16]
    h.memory.write(BASE + 0x400, &0xA941_1E06u32.to_le_bytes());
    h.memory.write(BASE + 0x813, &11u64.to_le_bytes());
    h.memory.write(BASE + 0x81B, &22u64.to_le_bytes());

    let reason = h.run([
        GuestEvent::mutate(|ctx| ctx.regs[16] = BASE + 0x803),
        GuestEvent::AlignmentFault,
        GuestEvent::SupervisorCall(0),
    ]);

    assert_eq!(reason, HaltReason::SUPERVISOR_CALL);
    let guest = h.engine.guest();
    assert_eq!(guest.cpu_registers[6], 11);
    assert_eq!(guest.cpu_registers[7], 22);
    assert_eq!(guest.pc, BASE + 0x408);
    assert_eq!(h.engine.fault_stats().alignment_emulated, 1);
}

#[test]
fn test_translation_invalidation_forces_new_lookup() {
    let mut h = harness();
    h.run([
        GuestEvent::access_fault(BASE + 0x5000),
        GuestEvent::SupervisorCall(0),
    ]);
    assert_eq!(h.engine.invalidate_translation_range(BASE + 0x5000, 0x1000), 1);
    assert!(h.engine.tlb().is_empty());

    h.run([
        GuestEvent::access_fault(BASE + 0x5010),
        GuestEvent::SupervisorCall(0),
    ]);
    assert_eq!(h.memory.invalidate_calls(), 2);
    assert_eq!(h.engine.tlb().len(), 1);
}
