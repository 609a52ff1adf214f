//! bcache_core: 块设备缓冲区缓存
//!
//! 一个写回式块缓存，位于文件系统与块驱动之间：
//! - 以 `(device, block, size)` 标识缓冲区，块大小为 512 到页大小之间的 2 的幂
//! - 按页分配内存，内存不足时回收干净缓冲区、整页回收或写回脏缓冲区
//! - 后台线程按年龄和脏数据比例写回
//! - 同步、失效、块大小切换等设备级操作
//!
//! # 示例
//!
//! ```rust,ignore
//! use bcache_core::{CacheConfig, CacheManager, DeviceId, MemDevice, SyncDriver};
//! use std::sync::Arc;
//!
//! fn main() -> bcache_core::Result<()> {
//!     let driver = Arc::new(SyncDriver::new());
//!     driver.register(DeviceId(1), MemDevice::new(512, 1 << 16))?;
//!
//!     let cache = CacheManager::new(CacheConfig::with_memory(1 << 20), driver)?;
//!     let bh = cache.read_through(DeviceId(1), 8, 1024)?;
//!     bh.write(|data| data.fill(0xAB));
//!     cache.mark_dirty(&bh, false);
//!     drop(bh);
//!
//!     cache.sync_device(DeviceId(1), true)?;
//!     Ok(())
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`consts`] - 常量定义
//! - [`types`] - 设备号、块键、大小类
//! - [`config`] - 缓存配置与可调参数
//! - [`block`] - 块设备与块驱动
//! - [`cache`] - 缓冲区缓存本体
//! - [`flush`] - 脏数据比例控制与后台写回

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 基础类型
pub mod types;

/// 配置
pub mod config;

/// 块设备抽象
pub mod block;

/// 块缓存
pub mod cache;

/// 写回控制
pub mod flush;

pub(crate) mod task;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 基础类型与配置
pub use config::{CacheConfig, TunableParam, Tunables};
pub use types::{BlockKey, DeviceId, IoDirection};

// 块设备
pub use block::{BlockDev, BlockDevice, BlockDriver, MemDevice, QueuedDriver, SyncDriver};

// Cache
pub use cache::{BufferFlags, BufferHandle, CacheManager, CacheStats, IoRequest};

// Flush
pub use flush::{FlushAction, FsSync, NoFsSync};
