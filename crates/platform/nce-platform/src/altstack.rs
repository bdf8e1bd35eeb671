//! 备用信号栈
//!
//! 每个执行引擎一块，匿名映射并在底部留一个不可访问的保护页。

use std::io;
use std::mem;
use std::ptr;

use log::{debug, warn};
use nce_core::{NceError, NceResult};

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// 匿名映射的信号栈
pub struct SignalStack {
    mapping: *mut u8,
    mapping_size: usize,
    stack: *mut u8,
    size: usize,
}

// SAFETY: the mapping is owned exclusively and only handed to the kernel.
unsafe impl Send for SignalStack {}
unsafe impl Sync for SignalStack {}

impl SignalStack {
    pub fn new(size: usize) -> NceResult<Self> {
        let page = page_size();
        let size = size.div_ceil(page) * page;
        let mapping_size = size + page;

        let stack_error = |reason: String| NceError::SignalStack { size, reason };

        // SAFETY: anonymous private mapping, checked for MAP_FAILED.
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(stack_error(io::Error::last_os_error().to_string()));
        }

        // SAFETY: the first page lies inside the mapping just created.
        if unsafe { libc::mprotect(mapping, page, libc::PROT_NONE) } != 0 {
            let reason = io::Error::last_os_error().to_string();
            // SAFETY: unmapping what we mapped.
            unsafe { libc::munmap(mapping, mapping_size) };
            return Err(stack_error(reason));
        }

        let mapping = mapping.cast::<u8>();
        Ok(Self {
            mapping,
            mapping_size,
            // SAFETY: page < mapping_size.
            stack: unsafe { mapping.add(page) },
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn base(&self) -> *mut u8 {
        self.stack
    }

    /// 注册为当前线程的备用信号栈
    pub fn register(&self) -> NceResult<()> {
        let ss = libc::stack_t {
            ss_sp: self.stack.cast(),
            ss_flags: 0,
            ss_size: self.size,
        };
        // SAFETY: the stack stays mapped for the lifetime of `self`.
        if unsafe { libc::sigaltstack(&ss, ptr::null_mut()) } != 0 {
            return Err(NceError::SignalStack {
                size: self.size,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        debug!("registered {}-byte signal stack at {:p}", self.size, self.stack);
        Ok(())
    }

    /// 当前线程是否正在使用这块栈
    pub fn is_current(&self) -> bool {
        // SAFETY: querying only.
        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            libc::sigaltstack(ptr::null(), &mut current) == 0
                && current.ss_sp.cast::<u8>() == self.stack
                && current.ss_flags & libc::SS_DISABLE == 0
        }
    }
}

impl Drop for SignalStack {
    fn drop(&mut self) {
        if self.is_current() {
            let ss = libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            };
            // SAFETY: disabling the alternate stack of this thread.
            if unsafe { libc::sigaltstack(&ss, ptr::null_mut()) } != 0 {
                warn!("failed to disable signal stack: {}", io::Error::last_os_error());
            }
        }
        // SAFETY: unmapping the region created in `new`.
        unsafe { libc::munmap(self.mapping.cast(), self.mapping_size) };
    }
}

impl std::fmt::Debug for SignalStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalStack")
            .field("base", &self.stack)
            .field("size", &self.size)
            .finish()
    }
}
