//! 脏数据比例控制
//!
//! 根据全局脏字节数与缓存内存的比例，决定写入者是否需要背压：
//!
//! - 超过硬阈值（`dirty_fraction`）：同步刷新，调用者阻塞到刷新有进展
//! - 超过软阈值（`dirty_fraction / 2`）：唤醒后台压力刷新线程，不阻塞
//! - 否则不做处理
//!
//! 脏字节数是全局的，不区分设备。

use crate::config::{TunableParam, Tunables};
use crate::error::Result;
use crate::types::DeviceId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 刷新决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    /// 无需处理
    NoAction,
    /// 唤醒后台刷新，不阻塞调用者
    AsyncFlush,
    /// 调用者应阻塞到刷新有进展
    SyncFlush,
}

/// 由计数器计算刷新决策，纯函数
///
/// `dirty_fraction` 为百分比；软阈值是它的一半。
pub fn classify_ratio(dirty_bytes: usize, total_bytes: usize, dirty_fraction: u64) -> FlushAction {
    if total_bytes == 0 {
        return FlushAction::NoAction;
    }
    let dirty = dirty_bytes as u128;
    let limit = total_bytes as u128 * dirty_fraction as u128;
    if dirty * 100 > limit {
        FlushAction::SyncFlush
    } else if dirty * 200 > limit {
        FlushAction::AsyncFlush
    } else {
        FlushAction::NoAction
    }
}

/// 刷新控制器
#[derive(Debug)]
pub struct FlushController {
    dirty_bytes: AtomicUsize,
    total_bytes: usize,
    tunables: RwLock<Tunables>,
}

impl FlushController {
    /// 创建控制器，`total_bytes` 为缓存可用内存
    pub fn new(total_bytes: usize, tunables: Tunables) -> Self {
        Self {
            dirty_bytes: AtomicUsize::new(0),
            total_bytes,
            tunables: RwLock::new(tunables),
        }
    }

    /// 当前脏字节数
    pub fn dirty_bytes(&self) -> usize {
        self.dirty_bytes.load(Ordering::Acquire)
    }

    /// 缓存内存总量
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// 脏数据比例
    pub fn dirty_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.dirty_bytes() as f64 / self.total_bytes as f64
        }
    }

    /// 缓冲区由干净变脏
    pub(crate) fn account_dirty(&self, size: u32) {
        self.dirty_bytes.fetch_add(size as usize, Ordering::AcqRel);
    }

    /// 缓冲区由脏变干净
    pub(crate) fn account_clean(&self, size: u32) {
        let prev = self.dirty_bytes.fetch_sub(size as usize, Ordering::AcqRel);
        debug_assert!(prev >= size as usize, "dirty byte accounting underflow");
    }

    /// 当前可调参数
    pub fn tunables(&self) -> Tunables {
        *self.tunables.read()
    }

    pub(crate) fn set_tunable(&self, param: TunableParam, value: u64) -> Result<()> {
        self.tunables.write().set(param, value)
    }

    /// 对设备 `dev` 的写入者给出刷新决策
    ///
    /// 计数是全局的，`dev` 目前不影响结果。
    pub fn classify(&self, _dev: DeviceId) -> FlushAction {
        self.classify_global()
    }

    pub(crate) fn classify_global(&self) -> FlushAction {
        classify_ratio(
            self.dirty_bytes(),
            self.total_bytes,
            self.tunables.read().dirty_fraction,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        // 40%：软阈值 20%，硬阈值 40%
        assert_eq!(classify_ratio(0, 1000, 40), FlushAction::NoAction);
        assert_eq!(classify_ratio(200, 1000, 40), FlushAction::NoAction);
        assert_eq!(classify_ratio(201, 1000, 40), FlushAction::AsyncFlush);
        assert_eq!(classify_ratio(400, 1000, 40), FlushAction::AsyncFlush);
        assert_eq!(classify_ratio(401, 1000, 40), FlushAction::SyncFlush);
    }

    #[test]
    fn test_empty_cache_never_flushes() {
        assert_eq!(classify_ratio(10, 0, 40), FlushAction::NoAction);
    }

    #[test]
    fn test_accounting() {
        let ctl = FlushController::new(4096, Tunables::default());
        ctl.account_dirty(1024);
        ctl.account_dirty(1024);
        assert_eq!(ctl.dirty_bytes(), 2048);
        assert_eq!(ctl.classify(DeviceId(0)), FlushAction::SyncFlush);
        ctl.account_clean(1024);
        ctl.account_clean(1024);
        assert_eq!(ctl.classify(DeviceId(0)), FlushAction::NoAction);
    }

    #[test]
    fn test_tunable_change_moves_thresholds() {
        let ctl = FlushController::new(1000, Tunables::default());
        ctl.account_dirty(300);
        assert_eq!(ctl.classify(DeviceId(1)), FlushAction::AsyncFlush);
        ctl.set_tunable(TunableParam::DirtyFraction, 20).unwrap();
        assert_eq!(ctl.classify(DeviceId(1)), FlushAction::SyncFlush);
        assert!(ctl.set_tunable(TunableParam::DirtyFraction, 101).is_err());
        assert_eq!(ctl.tunables().dirty_fraction, 20);
    }
}
