//! 块设备抽象
//!
//! 缓存通过 [`BlockDriver`] 提交 I/O；具体设备实现 [`BlockDevice`]，
//! 由 [`BlockDev`] 换算扇区地址并统计读写次数。

mod device;
mod driver;
mod memory;

pub use device::{BlockDev, BlockDevice};
pub use driver::{BlockDriver, QueuedDriver, SyncDriver};
pub use memory::MemDevice;
