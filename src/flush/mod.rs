//! 脏数据刷新
//!
//! - [`controller`]：脏数据比例控制，决定写入者是否需要背压
//! - [`flusher`]：周期刷新线程与压力刷新线程
//!
//! 文件系统层通过 [`FsSync`] 接入，周期刷新和全量同步时调用。

pub mod controller;
pub(crate) mod flusher;

pub use controller::{classify_ratio, FlushAction, FlushController};
pub(crate) use flusher::{FlushSignal, Flushers};

use crate::types::DeviceId;

/// 文件系统同步回调
///
/// 两个方法都是尽力而为，可以阻塞，没有返回值约定。`dev` 为 `None`
/// 表示全部设备。
pub trait FsSync: Send + Sync {
    /// 写回超级块
    fn sync_superblocks(&self, dev: Option<DeviceId>) {
        let _ = dev;
    }

    /// 写回 inode
    fn sync_inodes(&self, dev: Option<DeviceId>) {
        let _ = dev;
    }
}

/// 不做任何事的文件系统回调
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFsSync;

impl FsSync for NoFsSync {}
