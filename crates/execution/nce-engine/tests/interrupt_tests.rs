//! 中断协议测试
//!
//! 运行循环在测试主线程上执行，中断方在其他线程上调用 `signal_interrupt`。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nce_core::LockState;
use nce_engine::testing::{GuestEvent, RecordingMemory, ScriptedBackend};
use nce_engine::{GuestThread, GuestThreadState, HaltReason, NativeEngine, NceConfig};

const BASE: u64 = 0x4000_0000;

fn initialized() -> (NativeEngine<ScriptedBackend>, Arc<ScriptedBackend>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(ScriptedBackend::new());
    let memory = Arc::new(RecordingMemory::new(BASE, 0x1000));
    let config = NceConfig {
        enable_maintenance: false,
        ..NceConfig::default()
    };
    let mut engine = NativeEngine::with_backend(1, memory, config, Arc::clone(&backend)).unwrap();
    engine.initialize().unwrap();
    engine.guest_mut().pc = BASE;
    (engine, backend)
}

fn wait_until_running(thread: &GuestThreadState) {
    while !thread.control_block().is_running() {
        thread::yield_now();
    }
}

#[test]
fn test_interrupt_idle_thread_is_deferred() {
    let (mut engine, backend) = initialized();
    let thread = GuestThreadState::default();

    engine.signal_interrupt(&thread).unwrap();

    assert_eq!(backend.delivered_interrupts(), 0);
    assert_eq!(thread.control_block().lock_state(), LockState::Unlocked);

    let reason = engine.run_thread(&thread).unwrap();
    assert_eq!(reason, HaltReason::BREAK_LOOP);
    assert!(backend.entry_paths().is_empty());
}

#[test]
fn test_interrupt_running_guest() {
    let (mut engine, backend) = initialized();
    let thread = Arc::new(GuestThreadState::default());
    let interrupter = engine.interrupter();

    let target = Arc::clone(&thread);
    let handle = thread::spawn(move || {
        wait_until_running(&target);
        interrupter.signal_interrupt(target.as_ref())
    });

    let reason = engine.run_thread(thread.as_ref()).unwrap();
    handle.join().unwrap().unwrap();

    assert_eq!(reason, HaltReason::BREAK_LOOP);
    assert_eq!(backend.delivered_interrupts(), 1);
    assert_eq!(engine.guest().pc, BASE);
    assert_eq!(thread.control_block().lock_state(), LockState::Unlocked);
    assert!(!thread.control_block().is_running());
}

#[test]
fn test_interrupt_racing_entry_is_never_lost() {
    let (mut engine, backend) = initialized();
    let thread = Arc::new(GuestThreadState::default());

    for round in 0..200 {
        let interrupter = engine.interrupter();
        let target = Arc::clone(&thread);
        let handle = thread::spawn(move || interrupter.signal_interrupt(target.as_ref()));

        let reason = engine.run_thread(thread.as_ref()).unwrap();
        handle.join().unwrap().unwrap();

        assert!(
            reason.contains(HaltReason::BREAK_LOOP),
            "round {round}: {reason:?}"
        );
        assert!(!engine.guest().halt().is_pending());
    }
    // 只有在客户机运行时才会真正投递
    assert!(backend.delivered_interrupts() <= backend.entry_paths().len());
}

#[test]
fn test_interrupt_preempts_remaining_guest_code() {
    let (mut engine, backend) = initialized();
    let thread = Arc::new(GuestThreadState::default());
    let interrupter = engine.interrupter();

    let (target, scripted) = (Arc::clone(&thread), Arc::clone(&backend));
    backend.push(GuestEvent::mutate(move |ctx| {
        ctx.pc += 4;
        let (interrupter, target) = (interrupter.clone(), Arc::clone(&target));
        thread::spawn(move || interrupter.signal_interrupt(target.as_ref()).unwrap());
        while scripted.delivered_interrupts() == 0 {
            thread::yield_now();
        }
    }));
    backend.push(GuestEvent::SupervisorCall(5));

    let reason = engine.run_thread(thread.as_ref()).unwrap();
    assert_eq!(reason, HaltReason::BREAK_LOOP);
    assert_eq!(engine.guest().pc, BASE + 4);
    assert_eq!(backend.remaining_events(), 1);
    assert_eq!(thread.control_block().lock_state(), LockState::Unlocked);

    let reason = engine.run_thread(thread.as_ref()).unwrap();
    assert_eq!(reason, HaltReason::SUPERVISOR_CALL);
    assert_eq!(engine.svc_number(), 5);
    assert_eq!(engine.guest().pc, BASE + 8);
    assert_eq!(backend.delivered_interrupts(), 1);
}

#[test]
fn test_locked_thread_blocks_interrupter() {
    let (engine, _backend) = initialized();
    let thread = Arc::new(GuestThreadState::default());
    let done = Arc::new(AtomicBool::new(false));

    engine.lock_thread(thread.as_ref());

    let interrupter = engine.interrupter();
    let (target, finished) = (Arc::clone(&thread), Arc::clone(&done));
    let handle = thread::spawn(move || {
        interrupter.signal_interrupt(target.as_ref()).unwrap();
        finished.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));

    engine.unlock_thread(thread.as_ref());
    handle.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert!(engine.guest().halt().peek().contains(HaltReason::BREAK_LOOP));
}
