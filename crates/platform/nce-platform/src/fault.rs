//! 故障信息

use std::fmt;

/// 故障原因，取自 `siginfo_t::si_code`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// `SEGV_MAPERR`：地址未映射
    Unmapped,
    /// `SEGV_ACCERR`：权限不足（例如写只读页）
    Permission,
    /// `BUS_ADRALN`：未对齐访问
    Alignment,
    Other(i32),
}

impl FaultCode {
    pub fn is_permission(self) -> bool {
        self == Self::Permission
    }
}

/// 一次主机故障的地址与原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub address: u64,
    pub code: FaultCode,
}

impl FaultInfo {
    pub const fn new(address: u64, code: FaultCode) -> Self {
        Self { address, code }
    }

    pub const fn permission(address: u64) -> Self {
        Self::new(address, FaultCode::Permission)
    }

    pub const fn unmapped(address: u64) -> Self {
        Self::new(address, FaultCode::Unmapped)
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} fault at {:#x}", self.code, self.address)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{FaultCode, FaultInfo};

    const SEGV_MAPERR: i32 = 1;
    const SEGV_ACCERR: i32 = 2;
    const BUS_ADRALN: i32 = 1;

    impl FaultCode {
        pub fn from_si_code(signal: i32, code: i32) -> Self {
            match (signal, code) {
                (libc::SIGSEGV, SEGV_MAPERR) => Self::Unmapped,
                (libc::SIGSEGV, SEGV_ACCERR) => Self::Permission,
                (libc::SIGBUS, BUS_ADRALN) => Self::Alignment,
                (_, other) => Self::Other(other),
            }
        }
    }

    impl FaultInfo {
        /// # Safety
        ///
        /// `info` must point to the `siginfo_t` of a fault signal being handled.
        pub unsafe fn from_siginfo(signal: i32, info: *const libc::siginfo_t) -> Self {
            // SAFETY: fault signals always carry `si_addr`.
            let (address, code) = unsafe { ((*info).si_addr() as u64, (*info).si_code) };
            Self::new(address, FaultCode::from_si_code(signal, code))
        }
    }

}
