//! 信号链式转发：安装之后，不属于客户机的信号仍然到达之前的处理器

#![cfg(target_os = "linux")]

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use nce_platform::signals::{self, SigInfoHandler};

static PREVIOUS_CALLS: AtomicUsize = AtomicUsize::new(0);
static CHAINING_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn previous_handler(_: i32, _: *mut libc::siginfo_t, _: *mut c_void) {
    PREVIOUS_CALLS.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn chaining_handler(signal: i32, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    CHAINING_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { signals::chain_to_previous(signal, info, ctx) };
}

#[test]
fn test_foreign_signal_reaches_previous_handler() {
    let _ = env_logger::builder().is_test(true).try_init();

    unsafe {
        signals::install_handler(libc::SIGUSR1, previous_handler as SigInfoHandler, 0, false)
            .unwrap();
        signals::install_handler(libc::SIGUSR1, chaining_handler as SigInfoHandler, 0, true)
            .unwrap();
    }

    let previous = signals::previous_action(libc::SIGUSR1).unwrap();
    assert_eq!(previous.sa_sigaction, previous_handler as SigInfoHandler as usize);

    signals::deliver(signals::current_thread_id(), libc::SIGUSR1).unwrap();

    assert_eq!(CHAINING_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
}
