//! nce-platform: 原生执行的陷入平台
//!
//! 把直接操作操作系统执行上下文的不安全代码隔离在这里：信号安装、链式转发与投递，
//! 备用信号栈，以及对信号处理器中保存的主机上下文的读写。

use std::fmt;
use std::sync::atomic::{Ordering, fence};

pub mod context;
pub mod fault;

#[cfg(target_os = "linux")]
pub mod altstack;
#[cfg(target_os = "linux")]
pub mod signals;

pub use context::{CapturedContext, HostContext};
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub use context::UcontextView;
pub use fault::{FaultCode, FaultInfo};

// ============================================================================
// 内存屏障
// ============================================================================

pub fn barrier_full() {
    fence(Ordering::SeqCst);
}

// ============================================================================
// 平台检测
// ============================================================================

pub fn host_os() -> &'static str {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "android")] {
            "android"
        } else if #[cfg(target_os = "linux")] {
            "linux"
        } else if #[cfg(target_os = "macos")] {
            "macos"
        } else if #[cfg(target_os = "windows")] {
            "windows"
        } else {
            "unknown"
        }
    }
}

pub fn host_arch() -> &'static str {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            "aarch64"
        } else if #[cfg(target_arch = "x86_64")] {
            "x86_64"
        } else if #[cfg(target_arch = "riscv64")] {
            "riscv64"
        } else {
            "unknown"
        }
    }
}

/// 主机能否直接执行 AArch64 客户机代码
pub const fn supports_native_execution() -> bool {
    cfg!(all(target_os = "linux", target_arch = "aarch64"))
}

/// 操作系统层面的线程标识（Linux 上为 `gettid` 的返回值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostThreadId(pub i64);

impl HostThreadId {
    pub const fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for HostThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
