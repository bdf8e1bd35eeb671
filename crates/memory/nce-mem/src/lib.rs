//! nce-mem: 原生执行的软件 TLB
//!
//! 访问故障处理先查询 [`TranslationCache`]，未命中时才请求内存管理器；
//! [`MaintenanceTask`] 周期性清扫过期或饱和的条目。

pub mod sweeper;
pub mod tlb;

pub use sweeper::MaintenanceTask;
#[cfg(feature = "async")]
pub use sweeper::AsyncMaintenanceTask;
pub use tlb::{TlbEntry, TlbPolicy, TlbStats, TranslationCache};
