//! 原生执行配置
//!
//! 所有字段都有默认值，TOML 中可以只写需要覆盖的部分。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NceError, NceResult};

/// 信号栈的最小尺寸（与 AArch64 Linux 的 `MINSIGSTKSZ` 一致）
pub const MIN_SIGNAL_STACK_SIZE: usize = 5 * 1024;

/// 原生执行配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NceConfig {
    /// TLB 条目数量
    pub tlb_capacity: usize,
    /// 客户机页大小（必须是 2 的幂）
    pub guest_page_size: u64,
    /// 维护任务的清扫间隔（秒）
    pub sweep_interval_secs: u64,
    /// 条目过期时间（秒）
    pub entry_expiry_secs: u64,
    /// 访问计数超过该值的条目在清扫时被淘汰
    pub saturation_threshold: u32,
    /// 访问故障的最大重试次数
    pub access_fault_retries: u32,
    /// 每个引擎的备用信号栈大小
    pub signal_stack_size: usize,
    /// 是否启动后台维护任务
    pub enable_maintenance: bool,
}

impl Default for NceConfig {
    fn default() -> Self {
        Self {
            tlb_capacity: 1024,
            guest_page_size: crate::memory::GUEST_PAGE_SIZE,
            sweep_interval_secs: 60,
            entry_expiry_secs: 300,
            saturation_threshold: 1000,
            access_fault_retries: 3,
            signal_stack_size: 128 * 1024,
            enable_maintenance: true,
        }
    }
}

impl NceConfig {
    /// 从 TOML 文本加载并校验
    pub fn from_toml_str(text: &str) -> NceResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| NceError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NceResult<()> {
        if self.tlb_capacity == 0 {
            return Err(NceError::invalid_config("tlb_capacity", "must be non-zero"));
        }
        if !self.guest_page_size.is_power_of_two() {
            return Err(NceError::invalid_config(
                "guest_page_size",
                format!("{} is not a power of two", self.guest_page_size),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(NceError::invalid_config(
                "sweep_interval_secs",
                "must be non-zero",
            ));
        }
        if self.access_fault_retries == 0 {
            return Err(NceError::invalid_config(
                "access_fault_retries",
                "must be non-zero",
            ));
        }
        if self.signal_stack_size < MIN_SIGNAL_STACK_SIZE {
            return Err(NceError::invalid_config(
                "signal_stack_size",
                format!(
                    "{} bytes is below the minimum of {MIN_SIGNAL_STACK_SIZE}",
                    self.signal_stack_size
                ),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn entry_expiry(&self) -> Duration {
        Duration::from_secs(self.entry_expiry_secs)
    }
}
