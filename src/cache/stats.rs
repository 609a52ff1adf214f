//! 缓存统计信息

use std::sync::atomic::{AtomicU64, Ordering};

/// 缓存统计信息快照
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// 查找次数（含 get_or_create）
    pub lookups: u64,
    /// 哈希命中次数
    pub hits: u64,
    /// 未命中次数
    pub misses: u64,
    /// 分配新页次数
    pub grows: u64,
    /// 回收页次数
    pub shrinks: u64,
    /// 干净缓冲区被回收到空闲链表的次数
    pub recycles: u64,
    /// 提交的读请求数
    pub reads: u64,
    /// 提交的写请求数（写回次数）
    pub writebacks: u64,
    /// I/O 失败次数
    pub io_errors: u64,
    /// 调用者同步刷新次数
    pub sync_flushes: u64,
    /// 当前脏字节数
    pub dirty_bytes: usize,
    /// 已分配页数
    pub allocated_pages: usize,
    /// 页预算
    pub total_pages: usize,
    /// Clean 类缓冲区数
    pub clean_buffers: usize,
    /// Locked 类缓冲区数
    pub locked_buffers: usize,
    /// Dirty 类缓冲区数
    pub dirty_buffers: usize,
    /// 空闲链表上的缓冲区数
    pub free_buffers: usize,
    /// 哈希索引最长的桶链
    pub longest_hash_chain: usize,
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// 已缓存（不在空闲链表上）的缓冲区数
    pub fn cached_buffers(&self) -> usize {
        self.clean_buffers + self.locked_buffers + self.dirty_buffers
    }
}

/// 运行时计数器
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) lookups: AtomicU64,
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) grows: AtomicU64,
    pub(crate) shrinks: AtomicU64,
    pub(crate) recycles: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) writebacks: AtomicU64,
    pub(crate) io_errors: AtomicU64,
    pub(crate) sync_flushes: AtomicU64,
}

impl Counters {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// 填充快照中的计数器部分
    pub(crate) fn snapshot(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            lookups: load(&self.lookups),
            hits: load(&self.hits),
            misses: load(&self.misses),
            grows: load(&self.grows),
            shrinks: load(&self.shrinks),
            recycles: load(&self.recycles),
            reads: load(&self.reads),
            writebacks: load(&self.writebacks),
            io_errors: load(&self.io_errors),
            sync_flushes: load(&self.sync_flushes),
            ..CacheStats::default()
        }
    }
}
