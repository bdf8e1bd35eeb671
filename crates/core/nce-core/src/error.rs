//! 原生执行错误类型
//!
//! 只有与操作系统交互的边界（信号安装、信号栈、信号投递、配置加载、后台任务）
//! 会返回错误；故障处理本身通过 `FaultOutcome` 和停机原因位报告结果。

use thiserror::Error;

/// 原生执行统一错误类型
///
/// 实现 `Clone`，这样一次性安装的信号处理器结果可以被缓存并交给之后的每个调用者。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NceError {
    /// 信号处理器安装失败
    #[error("failed to install handler for signal {signal}: {reason}")]
    SignalSetup {
        /// 信号编号
        signal: i32,
        /// 失败原因
        reason: String,
    },

    /// 备用信号栈分配或注册失败
    #[error("failed to set up {size}-byte signal stack: {reason}")]
    SignalStack { size: usize, reason: String },

    /// 向执行线程投递信号失败
    #[error("failed to deliver signal {signal} to thread {thread_id}: {reason}")]
    SignalDelivery {
        signal: i32,
        thread_id: i64,
        reason: String,
    },

    /// 引擎在 `initialize` 之前被使用
    #[error("execution engine for core {core_index} is not initialized")]
    NotInitialized { core_index: usize },

    /// 引擎在初始化线程以外的线程上被使用
    #[error("execution engine for core {core_index} is bound to thread {expected}, called from thread {actual}")]
    WrongThread {
        core_index: usize,
        expected: i64,
        actual: i64,
    },

    /// 当前主机不支持原生执行
    #[error("native execution is not supported on {os}/{arch}")]
    UnsupportedHost {
        os: &'static str,
        arch: &'static str,
    },

    /// 配置项非法
    #[error("invalid configuration `{field}`: {message}")]
    InvalidConfig { field: String, message: String },

    /// 配置解析失败
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    /// 后台维护任务启动失败
    #[error("failed to spawn maintenance task: {0}")]
    TaskSpawn(String),
}

impl NceError {
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 是否因为主机平台不受支持
    pub fn is_unsupported_host(&self) -> bool {
        matches!(self, Self::UnsupportedHost { .. })
    }
}

pub type NceResult<T> = Result<T, NceError>;
