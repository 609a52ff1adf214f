//! 缓存配置与后台刷新可调参数
//!
//! `CacheConfig` 在初始化时确定缓存内存与页大小；`Tunables` 可以在运行时
//! 通过 [`CacheManager::set_tunable`](crate::CacheManager::set_tunable) 修改。
//! 所有参数都有文档化的上下限，越界的设置会被拒绝，而不是静默截断。

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use core::time::Duration;

/// 可调参数标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunableParam {
    /// 脏数据比例阈值（百分比）
    DirtyFraction,
    /// 每轮压力刷新最多提交的缓冲区数
    MaxBuffersPerPass,
    /// 周期刷新间隔（毫秒）
    FlushInterval,
    /// 普通数据块最大脏存活时间（毫秒）
    AgeBuffer,
    /// 元数据块最大脏存活时间（毫秒）
    AgeSuper,
}

impl TunableParam {
    /// 全部参数
    pub const ALL: [TunableParam; 5] = [
        TunableParam::DirtyFraction,
        TunableParam::MaxBuffersPerPass,
        TunableParam::FlushInterval,
        TunableParam::AgeBuffer,
        TunableParam::AgeSuper,
    ];

    /// 参数的闭区间范围 `(min, max)`
    pub const fn bounds(self) -> (u64, u64) {
        match self {
            TunableParam::DirtyFraction => (MIN_DIRTY_FRACTION, MAX_DIRTY_FRACTION),
            TunableParam::MaxBuffersPerPass => (MIN_MAX_BUFFERS_PER_PASS, MAX_MAX_BUFFERS_PER_PASS),
            TunableParam::FlushInterval | TunableParam::AgeBuffer | TunableParam::AgeSuper => {
                (MIN_TICKS_MS, MAX_TICKS_MS)
            }
        }
    }
}

/// 后台刷新可调参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// 脏数据比例阈值（百分比）；软阈值为其一半
    pub dirty_fraction: u64,
    /// 每轮压力刷新最多提交的缓冲区数
    pub max_buffers_per_pass: u64,
    /// 周期刷新间隔（毫秒）
    pub flush_interval_ms: u64,
    /// 普通数据块最大脏存活时间（毫秒）
    pub age_buffer_ms: u64,
    /// 元数据块最大脏存活时间（毫秒）
    pub age_super_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            dirty_fraction: DEFAULT_DIRTY_FRACTION,
            max_buffers_per_pass: DEFAULT_MAX_BUFFERS_PER_PASS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            age_buffer_ms: DEFAULT_AGE_BUFFER_MS,
            age_super_ms: DEFAULT_AGE_SUPER_MS,
        }
    }
}

impl Tunables {
    /// 读取参数值
    pub fn get(&self, param: TunableParam) -> u64 {
        match param {
            TunableParam::DirtyFraction => self.dirty_fraction,
            TunableParam::MaxBuffersPerPass => self.max_buffers_per_pass,
            TunableParam::FlushInterval => self.flush_interval_ms,
            TunableParam::AgeBuffer => self.age_buffer_ms,
            TunableParam::AgeSuper => self.age_super_ms,
        }
    }

    /// 设置参数值，越界返回 `InvalidInput`
    pub fn set(&mut self, param: TunableParam, value: u64) -> Result<()> {
        let (min, max) = param.bounds();
        if value < min || value > max {
            return Err(Error::new(ErrorKind::InvalidInput, "Tunable value out of range"));
        }
        match param {
            TunableParam::DirtyFraction => self.dirty_fraction = value,
            TunableParam::MaxBuffersPerPass => self.max_buffers_per_pass = value,
            TunableParam::FlushInterval => self.flush_interval_ms = value,
            TunableParam::AgeBuffer => self.age_buffer_ms = value,
            TunableParam::AgeSuper => self.age_super_ms = value,
        }
        Ok(())
    }

    /// 校验所有参数
    pub fn validate(&self) -> Result<()> {
        for param in TunableParam::ALL {
            let (min, max) = param.bounds();
            let value = self.get(param);
            if value < min || value > max {
                return Err(Error::new(ErrorKind::InvalidInput, "Tunable value out of range"));
            }
        }
        Ok(())
    }

    /// 周期刷新间隔
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// 脏缓冲区的刷新期限（元数据使用 `age_super`）
    pub fn dirty_age(&self, is_metadata: bool) -> Duration {
        if is_metadata {
            Duration::from_millis(self.age_super_ms)
        } else {
            Duration::from_millis(self.age_buffer_ms)
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// 缓存可使用的内存总量（字节），决定页预算
    pub total_memory: usize,
    /// 页大小（字节），同时是最大块大小
    pub page_size: u32,
    /// 哈希桶数量；`None` 时按内存大小自动选择
    pub hash_buckets: Option<usize>,
    /// 后台刷新参数
    pub tunables: Tunables,
    /// 是否启动两个后台刷新线程
    pub spawn_flushers: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_memory: DEFAULT_CACHE_MEMORY,
            page_size: DEFAULT_PAGE_SIZE,
            hash_buckets: None,
            tunables: Tunables::default(),
            spawn_flushers: true,
        }
    }
}

impl CacheConfig {
    /// 指定内存总量的默认配置
    pub fn with_memory(total_memory: usize) -> Self {
        Self {
            total_memory,
            ..Self::default()
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_BLOCK_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Page size must be a power of two between 512 and 65536",
            ));
        }
        if self.total_memory < self.page_size as usize {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Cache memory must hold at least one page",
            ));
        }
        if let Some(buckets) = self.hash_buckets {
            if buckets == 0 || !buckets.is_power_of_two() {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "Hash bucket count must be a power of two",
                ));
            }
        }
        self.tunables.validate()
    }

    /// 页预算（页数）
    pub fn total_pages(&self) -> usize {
        self.total_memory / self.page_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert_eq!(CacheConfig::default().total_pages(), 1024);
    }

    #[test]
    fn test_out_of_range_rejected_not_clamped() {
        let mut t = Tunables::default();
        let err = t.set(TunableParam::DirtyFraction, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(t.dirty_fraction, DEFAULT_DIRTY_FRACTION);

        assert!(t.set(TunableParam::FlushInterval, MAX_TICKS_MS + 1).is_err());
        assert_eq!(t.flush_interval_ms, DEFAULT_FLUSH_INTERVAL_MS);

        t.set(TunableParam::AgeSuper, 100).unwrap();
        assert_eq!(t.dirty_age(true), Duration::from_millis(100));
        assert_eq!(t.dirty_age(false), Duration::from_millis(DEFAULT_AGE_BUFFER_MS));
    }

    #[test]
    fn test_bad_config() {
        let mut config = CacheConfig::default();
        config.page_size = 3000;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::with_memory(100);
        assert!(config.validate().is_err());
        config.total_memory = 8192;
        config.hash_buckets = Some(100);
        assert!(config.validate().is_err());
    }
}
