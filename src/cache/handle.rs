//! 缓冲区句柄
//!
//! [`BufferHandle`] 是缓冲区的一个活跃引用：创建时引用计数加一，
//! drop 时减一。缓冲区本身仍由缓存的 arena 拥有，句柄只是借用凭证，
//! 因此"忘记释放"和"重复释放"都无法通过句柄写出来。

use super::buffer::{BufferFlags, BufferHead, BufferId};
use super::manager::CacheCore;
use crate::types::{BlockKey, DeviceId};
use std::sync::Arc;
use std::time::Instant;

/// 缓冲区句柄
///
/// # 示例
///
/// ```rust,ignore
/// let bh = cache.get_or_create(dev, 100, 1024)?;
/// bh.write(|data| data[..3].copy_from_slice(b"ABC"));
/// cache.mark_dirty(&bh, false);
/// drop(bh); // 引用计数减一，缓冲区仍留在缓存中
/// ```
pub struct BufferHandle {
    core: Arc<CacheCore>,
    head: Arc<BufferHead>,
    key: BlockKey,
}

impl BufferHandle {
    /// 接管一个已经计数的引用
    pub(crate) fn adopt(core: Arc<CacheCore>, head: Arc<BufferHead>, key: BlockKey) -> Self {
        debug_assert!(head.use_count() > 0);
        Self { core, head, key }
    }

    pub(crate) fn head(&self) -> &Arc<BufferHead> {
        &self.head
    }

    pub(crate) fn core(&self) -> &Arc<CacheCore> {
        &self.core
    }

    /// 缓冲区下标
    pub fn id(&self) -> BufferId {
        self.head.id()
    }

    /// 块身份
    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// 设备
    pub fn dev(&self) -> DeviceId {
        self.key.dev
    }

    /// 块号
    pub fn block(&self) -> u64 {
        self.key.block
    }

    /// 块大小
    pub fn size(&self) -> u32 {
        self.key.size
    }

    /// 状态标志快照
    pub fn flags(&self) -> BufferFlags {
        self.head.flags()
    }

    /// 是否脏
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(BufferFlags::DIRTY)
    }

    /// 内容是否有效
    pub fn is_uptodate(&self) -> bool {
        self.flags().contains(BufferFlags::UPTODATE)
    }

    /// 是否有 I/O 进行中
    pub fn is_locked(&self) -> bool {
        self.flags().contains(BufferFlags::LOCKED)
    }

    /// 脏缓冲区的写回期限
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.head.flush_deadline()
    }

    /// 当前引用计数
    pub fn use_count(&self) -> u32 {
        self.head.use_count()
    }

    /// 只读访问块数据
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.head.with_data(f)
    }

    /// 修改块数据
    ///
    /// 写入后内容视为有效（`UPTODATE`），但不会自动标脏，
    /// 需要再调用 `mark_dirty`。缓冲区正在读入时先等读完成，
    /// 否则设备数据会覆盖这次写入；正在写回时直接修改。
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        {
            let mut st = self.head.state.lock();
            self.head.wait_read_done_locked(&mut st);
            // 置为有效后不会再有读入开始
            st.flags.insert(BufferFlags::UPTODATE);
            st.flags.remove(BufferFlags::NEW);
        }
        self.head.with_data_mut(f)
    }

    /// 标脏，等同于 `CacheManager::mark_dirty`
    pub fn mark_dirty(&self, is_metadata: bool) {
        self.core.mark_dirty(self, is_metadata);
    }

    /// 等待进行中的 I/O 完成
    pub fn wait_unlocked(&self) {
        self.head.wait_unlocked();
    }

    /// 固定缓冲区，使其不参与回收
    pub fn protect(&self) {
        self.head.state.lock().flags.insert(BufferFlags::PROTECTED);
    }

    /// 取消固定
    pub fn unprotect(&self) {
        self.head.state.lock().flags.remove(BufferFlags::PROTECTED);
    }

    /// 是否被固定
    pub fn is_protected(&self) -> bool {
        self.flags().contains(BufferFlags::PROTECTED)
    }

    /// 两个句柄是否指向同一个缓冲区
    pub fn same_buffer(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.head, &other.head)
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        self.head.get();
        Self {
            core: self.core.clone(),
            head: self.head.clone(),
            key: self.key,
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.core.put(&self.head);
    }
}

impl core::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.head.id())
            .field("key", &self.key)
            .field("flags", &self.flags())
            .finish()
    }
}
