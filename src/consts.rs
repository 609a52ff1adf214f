//! 块缓冲区缓存常量定义
//!
//! 这个模块包含缓存使用的所有常量：
//! - 块大小与页大小的范围
//! - 哈希表大小范围
//! - 后台刷新可调参数的默认值与上下限

//=============================================================================
// 块与页
//=============================================================================

/// 最小块大小（扇区大小，512 字节）
pub const MIN_BLOCK_SIZE: u32 = 512;

/// 默认页大小（4096 字节）
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// 最大页大小（65536 字节）
pub const MAX_PAGE_SIZE: u32 = 65536;

/// 默认缓存内存（4 MiB）
pub const DEFAULT_CACHE_MEMORY: usize = 4 * 1024 * 1024;

//=============================================================================
// 哈希索引
//=============================================================================

/// 哈希桶数量下限
pub const MIN_HASH_BUCKETS: usize = 64;

/// 哈希桶数量上限
pub const MAX_HASH_BUCKETS: usize = 1 << 20;

/// 每个哈希桶平均承载的缓冲区数（按最小块大小估算）
pub const BUFFERS_PER_BUCKET: usize = 4;

//=============================================================================
// 后台刷新可调参数
//=============================================================================

/// 脏数据比例阈值（百分比）默认值
pub const DEFAULT_DIRTY_FRACTION: u64 = 40;
/// 脏数据比例阈值下限
pub const MIN_DIRTY_FRACTION: u64 = 1;
/// 脏数据比例阈值上限
pub const MAX_DIRTY_FRACTION: u64 = 100;

/// 每轮压力刷新最多提交的缓冲区数默认值
pub const DEFAULT_MAX_BUFFERS_PER_PASS: u64 = 500;
/// 每轮提交数下限
pub const MIN_MAX_BUFFERS_PER_PASS: u64 = 1;
/// 每轮提交数上限
pub const MAX_MAX_BUFFERS_PER_PASS: u64 = 50_000;

/// 周期刷新间隔（毫秒）默认值
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
/// 普通数据块的最大脏存活时间（毫秒）默认值
pub const DEFAULT_AGE_BUFFER_MS: u64 = 30_000;
/// 元数据块的最大脏存活时间（毫秒）默认值
pub const DEFAULT_AGE_SUPER_MS: u64 = 5_000;

/// 时间类参数下限（毫秒）
pub const MIN_TICKS_MS: u64 = 10;
/// 时间类参数上限（毫秒）
pub const MAX_TICKS_MS: u64 = 600_000;
