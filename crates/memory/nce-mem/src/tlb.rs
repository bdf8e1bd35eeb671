//! 软件 TLB (Translation Lookaside Buffer)
//!
//! 固定容量、线性扫描。故障处理路径（执行线程）和维护任务通过同一把互斥锁访问。

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use nce_core::NceConfig;
use parking_lot::Mutex;

/// TLB 条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Guest 地址（按 `size` 对齐）
    pub guest_addr: u64,
    /// Host 地址（按 `size` 对齐）
    pub host_addr: u64,
    /// 区域大小
    pub size: u64,
    pub valid: bool,
    pub writable: bool,
    /// 访问计数（饱和）
    pub access_count: u32,
    /// 最后访问时间
    pub last_access: Instant,
    /// 引用计数
    pub ref_count: u32,
}

impl TlbEntry {
    fn empty(now: Instant) -> Self {
        Self {
            guest_addr: 0,
            host_addr: 0,
            size: 0,
            valid: false,
            writable: false,
            access_count: 0,
            last_access: now,
            ref_count: 0,
        }
    }

    /// 检查地址是否在此条目范围内
    pub fn contains(&self, guest_addr: u64) -> bool {
        self.valid && guest_addr >= self.guest_addr && guest_addr - self.guest_addr < self.size
    }

    /// 是否与 `[addr, addr + size)` 重叠
    pub fn overlaps(&self, addr: u64, size: u64) -> bool {
        let end = addr.saturating_add(size);
        let entry_end = self.guest_addr.saturating_add(self.size);
        self.valid && addr < entry_end && self.guest_addr < end
    }

    /// 翻译地址
    pub fn translate(&self, guest_addr: u64) -> u64 {
        self.host_addr + (guest_addr - self.guest_addr)
    }
}

/// 容量与清扫策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbPolicy {
    pub capacity: usize,
    /// 访问计数超过该值的条目在清扫时失效
    pub saturation_threshold: u32,
    /// 超过该时间未访问的条目在清扫时失效
    pub expiry: Duration,
}

impl Default for TlbPolicy {
    fn default() -> Self {
        Self::from_config(&NceConfig::default())
    }
}

impl TlbPolicy {
    pub fn from_config(config: &NceConfig) -> Self {
        Self {
            capacity: config.tlb_capacity,
            saturation_threshold: config.saturation_threshold,
            expiry: config.entry_expiry(),
        }
    }
}

/// TLB 统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    /// 插入被拒绝的次数（空 host 地址或非法大小）
    pub rejected: u64,
    /// 被清扫或显式失效的条目数
    pub swept: u64,
}

impl TlbStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct TlbInner {
    entries: Vec<TlbEntry>,
    stats: TlbStats,
}

impl TlbInner {
    /// 选择插入位置：同一页的有效条目 > 第一个无效条目 > 访问计数最小（其次最旧）的条目
    fn slot_for(&self, guest_addr: u64, size: u64) -> (usize, bool) {
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.valid && e.guest_addr == guest_addr && e.size == size)
        {
            return (index, false);
        }
        if let Some(index) = self.entries.iter().position(|e| !e.valid) {
            return (index, false);
        }
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.access_count, e.last_access))
            .map_or(0, |(index, _)| index);
        (victim, true)
    }
}

/// 软件 TLB
pub struct TranslationCache {
    inner: Mutex<TlbInner>,
    policy: TlbPolicy,
}

impl TranslationCache {
    pub fn new(policy: TlbPolicy) -> Self {
        let now = Instant::now();
        let capacity = policy.capacity.max(1);
        Self {
            inner: Mutex::new(TlbInner {
                entries: vec![TlbEntry::empty(now); capacity],
                stats: TlbStats::default(),
            }),
            policy: TlbPolicy { capacity, ..policy },
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(TlbPolicy {
            capacity,
            ..TlbPolicy::default()
        })
    }

    pub fn from_config(config: &NceConfig) -> Self {
        Self::new(TlbPolicy::from_config(config))
    }

    pub fn capacity(&self) -> usize {
        self.policy.capacity
    }

    pub fn policy(&self) -> TlbPolicy {
        self.policy
    }

    /// 查找包含 `guest_addr` 的条目
    ///
    /// 命中时访问计数（饱和）和引用计数加一，其余字段不变。
    pub fn lookup(&self, guest_addr: u64) -> Option<TlbEntry> {
        let mut inner = self.inner.lock();
        let hit = inner.entries.iter_mut().find(|e| e.contains(guest_addr)).map(|entry| {
            entry.access_count = entry.access_count.saturating_add(1);
            entry.ref_count = entry.ref_count.wrapping_add(1);
            *entry
        });
        if hit.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        hit
    }

    /// 插入一个映射，返回是否成功
    pub fn insert(&self, guest_addr: u64, host_addr: u64, size: u64, writable: bool) -> bool {
        self.insert_at(guest_addr, host_addr, size, writable, Instant::now())
    }

    /// 以显式时间戳插入，用于确定性的测试
    pub fn insert_at(
        &self,
        guest_addr: u64,
        host_addr: u64,
        size: u64,
        writable: bool,
        now: Instant,
    ) -> bool {
        if host_addr == 0 {
            error!("Invalid host address for guest address {guest_addr:#x}");
            self.inner.lock().stats.rejected += 1;
            return false;
        }
        if !size.is_power_of_two() {
            error!("Invalid translation size {size:#x} for guest address {guest_addr:#x}");
            self.inner.lock().stats.rejected += 1;
            return false;
        }

        let mask = size - 1;
        let aligned_guest = guest_addr & !mask;
        let aligned_host = host_addr & !mask;

        let mut inner = self.inner.lock();
        let (index, evicted) = inner.slot_for(aligned_guest, size);
        if evicted {
            let victim = inner.entries[index];
            debug!(
                "TLB evicting {:#x} (access_count={}) for {aligned_guest:#x}",
                victim.guest_addr, victim.access_count
            );
            inner.stats.evictions += 1;
        }
        inner.entries[index] = TlbEntry {
            guest_addr: aligned_guest,
            host_addr: aligned_host,
            size,
            valid: true,
            writable,
            access_count: 0,
            last_access: now,
            ref_count: 0,
        };
        inner.stats.inserts += 1;
        trace!("TLB insert {aligned_guest:#x} -> {aligned_host:#x} slot {index}");
        true
    }

    /// 使饱和或过期的条目失效，返回失效数量
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let threshold = self.policy.saturation_threshold;
        let expiry = self.policy.expiry;
        let mut inner = self.inner.lock();
        let mut swept = 0;
        for entry in inner.entries.iter_mut().filter(|e| e.valid) {
            if entry.access_count > threshold
                || now.saturating_duration_since(entry.last_access) > expiry
            {
                entry.valid = false;
                swept += 1;
            }
        }
        inner.stats.swept += swept as u64;
        if swept > 0 {
            debug!("TLB sweep invalidated {swept} entries");
        }
        swept
    }

    /// 使与 `[addr, addr + size)` 重叠的条目失效
    pub fn invalidate_range(&self, addr: u64, size: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        for entry in inner.entries.iter_mut().filter(|e| e.overlaps(addr, size)) {
            entry.valid = false;
            dropped += 1;
        }
        inner.stats.swept += dropped as u64;
        dropped
    }

    /// 清空所有条目
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        for entry in inner.entries.iter_mut().filter(|e| e.valid) {
            entry.valid = false;
            dropped += 1;
        }
        inner.stats.swept += dropped;
    }

    /// 有效条目数
    pub fn len(&self) -> usize {
        self.inner.lock().entries.iter().filter(|e| e.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 有效条目快照（不影响访问计数）
    pub fn entries(&self) -> Vec<TlbEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.valid)
            .copied()
            .collect()
    }

    pub fn stats(&self) -> TlbStats {
        self.inner.lock().stats
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(TlbPolicy::default())
    }
}

impl fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationCache")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
