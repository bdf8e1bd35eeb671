//! nce-engine: 原生代码执行引擎
//!
//! 在宿主 CPU 上直接运行 AArch64 客户机代码：
//! - [`NativeEngine`]：每核心的运行循环、寄存器访问与中断协议；
//! - [`FaultDispatcher`]：访问故障（经由 TLB 和内存管理器）与未对齐访问（经由解释器）；
//! - [`switch`]：宿主与客户机之间的上下文切换；
//! - [`TrapBackend`]：陷入机制，[`NativeBackend`] 基于信号，[`testing::ScriptedBackend`] 用于测试。

mod arch;
pub mod backend;
pub mod dispatch;
pub mod engine;
pub mod interp;
pub mod switch;
pub mod testing;
pub mod thread;

pub use backend::{EntryPath, GuestEntry, NativeBackend, TrapBackend};
pub use dispatch::{FaultDispatcher, FaultOutcome, FaultStats};
pub use engine::{Interrupter, NativeEngine};
pub use thread::{GuestThread, GuestThreadState, PostHandlerTable};

pub use nce_core::{HaltReason, NceConfig, NceError, NceResult, ThreadContext};
