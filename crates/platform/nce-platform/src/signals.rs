//! 信号处理
//!
//! 安装客户机陷入用的信号处理器，保存之前的处理动作以便把主机自身的故障转发回去，
//! 以及按线程投递信号。

use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use log::debug;
use nce_core::{NceError, NceResult};

use crate::HostThreadId;

/// 通过异常级别切换进入客户机
pub const GUEST_ENTER_SIGNAL: i32 = libc::SIGUSR2;
/// 打断正在运行的客户机
pub const BREAK_FROM_GUEST_SIGNAL: i32 = libc::SIGURG;
/// 客户机未对齐访问
pub const GUEST_ALIGNMENT_FAULT_SIGNAL: i32 = libc::SIGBUS;
/// 客户机访问故障
pub const GUEST_ACCESS_FAULT_SIGNAL: i32 = libc::SIGSEGV;

/// `SA_SIGINFO` 处理器类型
pub type SigInfoHandler = unsafe extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void);
type PlainHandler = extern "C" fn(i32);

const MAX_SIGNAL: usize = 65;

struct PreviousAction(libc::sigaction);

// 安装时保存的旧处理动作，只写一次，之后在信号处理器中只读
static PREVIOUS_ACTIONS: [OnceLock<PreviousAction>; MAX_SIGNAL] =
    [const { OnceLock::new() }; MAX_SIGNAL];

fn last_os_error() -> String {
    io::Error::last_os_error().to_string()
}

/// 处理器执行期间屏蔽的信号集合：四个陷入信号全部屏蔽
pub fn guest_signal_mask() -> libc::sigset_t {
    // SAFETY: sigset_t is plain data and is initialised by sigemptyset.
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        for signal in [
            GUEST_ENTER_SIGNAL,
            BREAK_FROM_GUEST_SIGNAL,
            GUEST_ALIGNMENT_FAULT_SIGNAL,
            GUEST_ACCESS_FAULT_SIGNAL,
        ] {
            libc::sigaddset(&mut mask, signal);
        }
        mask
    }
}

/// 注册 `SA_SIGINFO | SA_ONSTACK | extra_flags` 处理器
///
/// `chain` 为真时保存之前的处理动作，供 [`chain_to_previous`] 使用。
///
/// # Safety
///
/// `handler` must only run code that cannot deadlock or corrupt state the
/// interrupted code may be holding at any point the signal can arrive.
pub unsafe fn install_handler(
    signal: i32,
    handler: SigInfoHandler,
    extra_flags: i32,
    chain: bool,
) -> NceResult<()> {
    // SAFETY: both structures are plain data, fully initialised before use.
    let (action, mut previous) = unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | extra_flags;
        action.sa_mask = guest_signal_mask();
        (action, mem::zeroed::<libc::sigaction>())
    };

    // SAFETY: valid pointers to initialised sigaction structures.
    if unsafe { libc::sigaction(signal, &action, &mut previous) } != 0 {
        return Err(NceError::SignalSetup {
            signal,
            reason: last_os_error(),
        });
    }

    if chain {
        if let Some(slot) = PREVIOUS_ACTIONS.get(signal as usize) {
            let _ = slot.set(PreviousAction(previous));
        }
    }
    debug!("installed handler for signal {signal} (chain={chain})");
    Ok(())
}

/// 之前保存的处理动作
pub fn previous_action(signal: i32) -> Option<libc::sigaction> {
    PREVIOUS_ACTIONS
        .get(usize::try_from(signal).ok()?)?
        .get()
        .map(|action| action.0)
}

fn restore_default(signal: i32) {
    // SAFETY: installing SIG_DFL has no preconditions.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signal, &action, ptr::null_mut());
    }
}

/// 把不属于客户机的信号转发给安装前的处理动作
///
/// 之前是默认动作时恢复默认动作后返回：故障指令会重新执行并由内核按默认方式处理。
///
/// # Safety
///
/// Must be called from a signal handler with the arguments it received.
pub unsafe fn chain_to_previous(signal: i32, info: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(previous) = previous_action(signal) else {
        restore_default(signal);
        return;
    };

    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL {
        restore_default(signal);
    } else if handler == libc::SIG_IGN {
        // ignored
    } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: SA_SIGINFO actions store a three-argument handler.
        let handler: SigInfoHandler = unsafe { mem::transmute::<usize, SigInfoHandler>(handler) };
        unsafe { handler(signal, info, context) };
    } else {
        // SAFETY: plain actions store a one-argument handler.
        let handler: PlainHandler = unsafe { mem::transmute::<usize, PlainHandler>(handler) };
        handler(signal);
    }
}

/// 当前线程的内核线程 ID
pub fn current_thread_id() -> HostThreadId {
    // SAFETY: gettid cannot fail.
    HostThreadId(unsafe { libc::syscall(libc::SYS_gettid) } as i64)
}

/// 向指定线程投递信号
pub fn deliver(thread: HostThreadId, signal: i32) -> NceResult<()> {
    // SAFETY: tkill only reads its integer arguments.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_tkill,
            thread.raw() as libc::c_long,
            libc::c_long::from(signal),
        )
    };
    if rc != 0 {
        return Err(NceError::SignalDelivery {
            signal,
            thread_id: thread.raw(),
            reason: last_os_error(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_blocks_trap_signals_only() {
        let mask = guest_signal_mask();
        for signal in [libc::SIGUSR2, libc::SIGURG, libc::SIGBUS, libc::SIGSEGV] {
            assert_eq!(unsafe { libc::sigismember(&mask, signal) }, 1);
        }
        assert_eq!(unsafe { libc::sigismember(&mask, libc::SIGINT) }, 0);
    }

    #[test]
    fn test_current_thread_id_differs_per_thread() {
        let main = current_thread_id();
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert!(main.raw() > 0);
        assert_ne!(main, other);
    }

    #[test]
    fn test_deliver_to_missing_thread_fails() {
        let err = deliver(HostThreadId(i32::MAX as i64), 0).unwrap_err();
        assert!(matches!(err, NceError::SignalDelivery { .. }));
    }
}
