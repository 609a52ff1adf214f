//! 缓冲区头结构
//!
//! [`BufferHead`] 是缓存的基本单元：块身份、状态标志、引用计数，以及指向
//! 所属页中一段内存的数据区。链表与哈希链的链接不在这里，而是按
//! [`BufferId`] 存放在各自的结构中，由各自的锁保护。
//!
//! 状态标志由每个缓冲区自己的状态锁保护；`LOCKED` 是一把逻辑上的睡眠锁，
//! 等待者睡在缓冲区的等待队列上，解锁时唤醒全部等待者。

use super::page::PageId;
use crate::types::{BlockKey, IoDirection};
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// 缓冲区在 arena 中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

impl BufferId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// 缓冲区状态标志
    ///
    /// 标志可以同时存在，例如写回中的缓冲区同时是 `LOCKED` 和 `DIRTY`。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u8 {
        /// I/O 进行中（逻辑睡眠锁）
        const LOCKED    = 0x01;
        /// 内容比设备新
        const DIRTY     = 0x02;
        /// 内容有效
        const UPTODATE  = 0x04;
        /// 已绑定到设备上的真实块
        const MAPPED    = 0x08;
        /// 至少发起过一次 I/O
        const REQUESTED = 0x10;
        /// 新分配，内容尚未初始化
        const NEW       = 0x20;
        /// 固定，不参与回收
        const PROTECTED = 0x40;
    }
}

/// LRU 类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LruClass {
    /// 干净
    Clean = 0,
    /// I/O 进行中且不脏
    Locked = 1,
    /// 脏（不论是否正在写回）
    Dirty = 2,
}

impl LruClass {
    /// 全部 LRU 类，按加锁顺序排列
    pub const ALL: [LruClass; 3] = [LruClass::Clean, LruClass::Locked, LruClass::Dirty];

    /// 由标志决定缓冲区所属的 LRU 类
    pub fn for_flags(flags: BufferFlags) -> Self {
        if flags.contains(BufferFlags::DIRTY) {
            LruClass::Dirty
        } else if flags.contains(BufferFlags::LOCKED) {
            LruClass::Locked
        } else {
            LruClass::Clean
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// 受缓冲区状态锁保护的字段
#[derive(Debug)]
pub(crate) struct BufferState {
    /// 块身份；在空闲链表上时为 `None`
    pub(crate) key: Option<BlockKey>,
    pub(crate) flags: BufferFlags,
    /// 周期刷新的期限
    pub(crate) flush_deadline: Option<Instant>,
    /// 当前所在的 LRU 类；在空闲链表上或正在安装时为 `None`
    pub(crate) lru_class: Option<LruClass>,
    /// 每次 mark_dirty 加一
    pub(crate) dirty_seq: u64,
    /// 写回提交时记录的 `dirty_seq`
    pub(crate) write_seq: Option<u64>,
    /// 进行中的 I/O 方向，与 `LOCKED` 同时置位和清除
    pub(crate) io: Option<IoDirection>,
}

impl BufferState {
    fn free() -> Self {
        Self {
            key: None,
            flags: BufferFlags::NEW,
            flush_deadline: None,
            lru_class: None,
            dirty_seq: 0,
            write_seq: None,
            io: None,
        }
    }

    pub(crate) fn class(&self) -> LruClass {
        LruClass::for_flags(self.flags)
    }

    /// 回到空闲链表时的状态
    pub(crate) fn reset_free(&mut self) {
        *self = Self::free();
    }

    /// 绑定到新的块身份
    pub(crate) fn bind(&mut self, key: BlockKey, class: LruClass) {
        self.key = Some(key);
        self.flags = BufferFlags::MAPPED | BufferFlags::NEW;
        self.flush_deadline = None;
        self.lru_class = Some(class);
        self.dirty_seq = 0;
        self.write_seq = None;
        self.io = None;
    }

    /// 锁定缓冲区并记录 I/O 方向
    pub(crate) fn lock_io(&mut self, direction: IoDirection) {
        self.flags.insert(BufferFlags::LOCKED | BufferFlags::REQUESTED);
        self.io = Some(direction);
    }
}

/// 缓冲区头
///
/// # 字段说明
///
/// - `id`: arena 下标，替代指针
/// - `page`: 所属页（只是反向引用，不拥有页）
/// - `size`: 块大小，由所属页的大小类决定，终身不变
/// - `use_count`: 活跃借用者数量，归零前不能被回收
/// - `state`: 身份、标志、刷新期限等
/// - `unlocked`: `LOCKED` 的等待队列
/// - `data`: 块数据
pub struct BufferHead {
    id: BufferId,
    page: PageId,
    size: u32,
    use_count: AtomicU32,
    pub(crate) state: Mutex<BufferState>,
    unlocked: Condvar,
    data: RwLock<Box<[u8]>>,
}

impl core::fmt::Debug for BufferHead {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("BufferHead")
            .field("id", &self.id)
            .field("page", &self.page)
            .field("size", &self.size)
            .field("use_count", &self.use_count())
            .field("key", &st.key)
            .field("flags", &st.flags)
            .field("lru_class", &st.lru_class)
            .finish()
    }
}

impl BufferHead {
    /// 创建新的缓冲区头，数据区取自所属页
    pub(crate) fn new(id: BufferId, page: PageId, data: Box<[u8]>) -> Self {
        Self {
            id,
            page,
            size: data.len() as u32,
            use_count: AtomicU32::new(0),
            state: Mutex::new(BufferState::free()),
            unlocked: Condvar::new(),
            data: RwLock::new(data),
        }
    }

    /// arena 下标
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// 所属页
    pub fn page(&self) -> PageId {
        self.page
    }

    /// 块大小
    pub fn size(&self) -> u32 {
        self.size
    }

    /// 当前引用计数
    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    /// 块身份
    pub fn key(&self) -> Option<BlockKey> {
        self.state.lock().key
    }

    /// 状态标志快照
    pub fn flags(&self) -> BufferFlags {
        self.state.lock().flags
    }

    /// 周期刷新期限
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.state.lock().flush_deadline
    }

    /// 增加引用计数，返回新值
    pub(crate) fn get(&self) -> u32 {
        self.use_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 减少引用计数，返回新值
    ///
    /// 计数已为 0 时再释放是不可恢复的编程错误。
    pub(crate) fn put(&self) -> u32 {
        let prev = self.use_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "buffer {:?} released with use_count 0", self.id);
        prev - 1
    }

    /// 安装到新身份时置引用计数为 1
    pub(crate) fn claim(&self) {
        let prev = self.use_count.swap(1, Ordering::AcqRel);
        assert_eq!(prev, 0, "buffer {:?} recycled while in use", self.id);
    }

    /// 在持有状态锁的情况下等待 `LOCKED` 清除
    pub(crate) fn wait_unlocked_locked(&self, st: &mut MutexGuard<'_, BufferState>) {
        while st.flags.contains(BufferFlags::LOCKED) {
            self.unlocked.wait(st);
        }
    }

    /// 在持有状态锁的情况下等待进行中的读完成
    ///
    /// 读完成时驱动会覆盖整个数据区；写回中的缓冲区不必等待。
    pub(crate) fn wait_read_done_locked(&self, st: &mut MutexGuard<'_, BufferState>) {
        while st.io == Some(IoDirection::Read) {
            self.unlocked.wait(st);
        }
    }

    /// 等待 `LOCKED` 清除
    pub(crate) fn wait_unlocked(&self) {
        let mut st = self.state.lock();
        self.wait_unlocked_locked(&mut st);
    }

    /// 唤醒等待队列上的全部等待者
    pub(crate) fn wake_waiters(&self) {
        self.unlocked.notify_all();
    }

    /// 只读访问数据
    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    /// 可写访问数据
    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }

    /// 页回收时取回数据区
    pub(crate) fn take_data(&self) -> Box<[u8]> {
        core::mem::take(&mut *self.data.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    fn head() -> BufferHead {
        BufferHead::new(BufferId(0), PageId(0), vec![0u8; 1024].into_boxed_slice())
    }

    #[test]
    fn test_buffer_creation() {
        let bh = head();
        assert_eq!(bh.size(), 1024);
        assert_eq!(bh.use_count(), 0);
        assert_eq!(bh.key(), None);
        assert_eq!(bh.flags(), BufferFlags::NEW);
    }

    #[test]
    fn test_reference_counting() {
        let bh = head();
        assert_eq!(bh.get(), 1);
        assert_eq!(bh.get(), 2);
        assert_eq!(bh.put(), 1);
        assert_eq!(bh.put(), 0);
    }

    #[test]
    #[should_panic]
    fn test_double_release_is_fatal() {
        let bh = head();
        bh.put();
    }

    #[test]
    fn test_class_mapping() {
        assert_eq!(LruClass::for_flags(BufferFlags::UPTODATE), LruClass::Clean);
        assert_eq!(LruClass::for_flags(BufferFlags::LOCKED), LruClass::Locked);
        assert_eq!(LruClass::for_flags(BufferFlags::DIRTY), LruClass::Dirty);
        assert_eq!(
            LruClass::for_flags(BufferFlags::DIRTY | BufferFlags::LOCKED),
            LruClass::Dirty
        );
    }

    #[test]
    fn test_bind_and_reset() {
        let bh = head();
        let key = BlockKey::new(DeviceId(1), 5, 1024);
        {
            let mut st = bh.state.lock();
            st.bind(key, LruClass::Clean);
            assert_eq!(st.flags, BufferFlags::MAPPED | BufferFlags::NEW);
            st.flags.insert(BufferFlags::DIRTY);
            assert_eq!(st.class(), LruClass::Dirty);
            st.reset_free();
        }
        assert_eq!(bh.key(), None);
        assert_eq!(bh.flags(), BufferFlags::NEW);
    }

    #[test]
    fn test_waiters_wake_on_unlock() {
        use std::sync::Arc;

        let bh = Arc::new(head());
        bh.state.lock().flags.insert(BufferFlags::LOCKED);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let bh = bh.clone();
                std::thread::spawn(move || bh.wait_unlocked())
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(20));
        bh.state.lock().flags.remove(BufferFlags::LOCKED);
        bh.wake_waiters();

        for w in waiters {
            w.join().unwrap();
        }
    }
}
