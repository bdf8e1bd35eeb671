//! TLB 维护任务
//!
//! 按固定间隔调用 [`TranslationCache::sweep`]。默认使用独立的 OS 线程；
//! 启用 `async` 特性后也可以作为 tokio 任务运行。

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nce_core::{NceError, NceResult};
use parking_lot::{Condvar, Mutex};

use crate::tlb::TranslationCache;

const THREAD_NAME: &str = "nce-tlb-sweep";

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// 后台清扫线程，drop 时停止并回收
pub struct MaintenanceTask {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl MaintenanceTask {
    pub fn spawn(cache: Arc<TranslationCache>, interval: Duration) -> NceResult<Self> {
        let stop = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let worker_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || Self::run(&cache, &worker_stop, interval))
            .map_err(|e| NceError::TaskSpawn(e.to_string()))?;

        info!("TLB maintenance task started, interval {interval:?}");
        Ok(Self {
            stop,
            handle: Some(handle),
            interval,
        })
    }

    fn run(cache: &TranslationCache, stop: &StopSignal, interval: Duration) {
        let mut stopped = stop.stopped.lock();
        loop {
            let deadline = Instant::now() + interval;
            while !*stopped {
                if stop.wake.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                break;
            }

            // 清扫时不持有停止锁
            let swept = parking_lot::MutexGuard::unlocked(&mut stopped, || cache.sweep());
            debug!("TLB maintenance pass invalidated {swept} entries");
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 请求停止并等待线程退出
    pub fn stop(&mut self) {
        *self.stop.stopped.lock() = true;
        self.stop.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("TLB maintenance thread panicked");
            }
            info!("TLB maintenance task stopped");
        }
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceTask")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// 异步版本
// ============================================================================

#[cfg(feature = "async")]
pub use self::async_task::AsyncMaintenanceTask;

#[cfg(feature = "async")]
mod async_task {
    use super::*;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    /// 作为 tokio 任务运行的清扫器
    pub struct AsyncMaintenanceTask {
        stop_signal: Arc<Notify>,
        handle: Option<JoinHandle<()>>,
    }

    impl AsyncMaintenanceTask {
        /// 必须在 tokio 运行时内调用
        pub fn spawn(cache: Arc<TranslationCache>, interval: Duration) -> NceResult<Self> {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| NceError::TaskSpawn(e.to_string()))?;
            let stop_signal = Arc::new(Notify::new());
            let task_stop = Arc::clone(&stop_signal);

            let handle = runtime.spawn(async move {
                let start = tokio::time::Instant::now() + interval;
                let mut ticker = tokio::time::interval_at(start, interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let swept = cache.sweep();
                            debug!("TLB maintenance pass invalidated {swept} entries");
                        }
                        _ = task_stop.notified() => {
                            break;
                        }
                    }
                }
            });

            info!("TLB maintenance task started on tokio runtime, interval {interval:?}");
            Ok(Self {
                stop_signal,
                handle: Some(handle),
            })
        }

        /// 停止并等待任务结束
        pub async fn shutdown(mut self) {
            self.stop_signal.notify_one();
            if let Some(handle) = self.handle.take() {
                if let Err(e) = handle.await {
                    warn!("TLB maintenance task failed: {e}");
                }
            }
        }
    }

    impl Drop for AsyncMaintenanceTask {
        fn drop(&mut self) {
            if self.handle.is_some() {
                self.stop_signal.notify_one();
            }
        }
    }
}
