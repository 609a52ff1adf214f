//! 缓存管理器
//!
//! [`CacheManager`] 把哈希索引、空闲链表、页表、LRU 队列和刷新控制器组织
//! 在一起，提供按 `(device, block, size)` 获取、读取、标脏、写回、失效和
//! 同步缓冲区的操作。
//!
//! # 锁顺序
//!
//! 需要同时持有多把结构锁时，一律按下面的顺序获取：
//!
//! 1. LRU 类锁（Clean → Locked → Dirty）
//! 2. 哈希索引锁
//! 3. 各大小类的空闲链表锁（按大小类下标递增）
//! 4. 页表锁
//! 5. arena 锁
//! 6. 缓冲区状态锁
//!
//! 持有缓冲区状态锁时不再获取任何其他锁。引用计数从 0 变为 1 只能发生在
//! 哈希锁或 LRU 类锁之下，回收者在同样的锁下检查引用计数为 0，
//! 因此不会回收一个正在被借出的缓冲区。

use super::arena::Arena;
use super::buffer::{BufferFlags, BufferHead, BufferId, BufferState, LruClass};
use super::handle::BufferHandle;
use super::hash::HashIndex;
use super::io::{CompletionKind, IoRequest, KioVec, PageIo};
use super::list::IdList;
use super::lru::LruQueues;
use super::page::{BudgetAllocator, PageAllocator, PageBufferMap, PageFrame, PageTable};
use super::stats::{CacheStats, Counters};
use crate::block::BlockDriver;
use crate::config::{CacheConfig, TunableParam, Tunables};
use crate::consts::MIN_BLOCK_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::flush::{FlushAction, FlushController, FlushSignal, Flushers, FsSync, NoFsSync};
use crate::types::{class_block_size, size_class_count, size_class_index, BlockKey, DeviceId, IoDirection};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 等待空闲缓冲区时单次睡眠的上限
const FREE_WAIT_SLICE: Duration = Duration::from_millis(100);

/// 不会回收、不会驱逐的状态
const BUSY_FLAGS: BufferFlags = BufferFlags::LOCKED.union(BufferFlags::DIRTY);

fn class_index(size: u32) -> usize {
    (size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize
}

fn first_error(slot: &mut Option<Error>, err: Error) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// Dirty 队列上的游标扫描
///
/// 扫描期间不持有队列锁。每一步重新取得队列锁，若上一个位置已被移出
/// 队列或表头已变化，则从表头重新开始；总步数不超过开始时的队列长度。
pub(crate) struct DirtyScan {
    budget: usize,
    cursor: Option<(BufferId, u64)>,
}

impl DirtyScan {
    pub(crate) fn new(core: &CacheCore) -> Self {
        Self {
            budget: core.lru.len(LruClass::Dirty),
            cursor: None,
        }
    }

    /// 前进一步，返回当前位置的缓冲区和仍持有的队列锁
    pub(crate) fn advance<'a>(
        &mut self,
        core: &'a CacheCore,
    ) -> Option<(Arc<BufferHead>, MutexGuard<'a, IdList>)> {
        if self.budget == 0 {
            return None;
        }
        self.budget -= 1;
        let list = core.lru.lock(LruClass::Dirty);
        let next = match self.cursor {
            Some((id, gen)) if gen == list.head_generation() && list.contains(id) => list.next(id),
            _ => list.front(),
        }?;
        self.cursor = Some((next, list.head_generation()));
        Some((core.head(next), list))
    }
}

/// 缓存共享状态
///
/// 由 [`CacheManager`]、所有 [`BufferHandle`] 以及两个后台刷新线程共享。
pub(crate) struct CacheCore {
    page_size: u32,
    allocator: Arc<dyn PageAllocator>,
    driver: Arc<dyn BlockDriver>,
    pub(crate) fs: Arc<dyn FsSync>,
    arena: RwLock<Arena>,
    hash: RwLock<HashIndex>,
    free: Vec<Mutex<IdList>>,
    pages: Mutex<PageTable>,
    lru: LruQueues,
    pub(crate) flush: FlushController,
    pub(crate) signal: FlushSignal,
    counters: Counters,
    /// 每有一个缓冲区引用计数归零加一
    free_seq: Mutex<u64>,
    free_cv: Condvar,
    /// 每个设备当前的块大小
    dev_sizes: Mutex<BTreeMap<DeviceId, u32>>,
}

impl CacheCore {
    fn new(
        config: &CacheConfig,
        driver: Arc<dyn BlockDriver>,
        fs: Arc<dyn FsSync>,
        allocator: Arc<dyn PageAllocator>,
    ) -> Self {
        let page_size = config.page_size;
        let buckets = config
            .hash_buckets
            .unwrap_or_else(|| HashIndex::buckets_for_memory(config.total_memory));
        let total_bytes = allocator.total_pages() * page_size as usize;
        Self {
            page_size,
            allocator,
            driver,
            fs,
            arena: RwLock::new(Arena::new()),
            hash: RwLock::new(HashIndex::new(buckets)),
            free: (0..size_class_count(page_size))
                .map(|_| Mutex::new(IdList::new()))
                .collect(),
            pages: Mutex::new(PageTable::new()),
            lru: LruQueues::new(),
            flush: FlushController::new(total_bytes, config.tunables),
            signal: FlushSignal::new(),
            counters: Counters::default(),
            free_seq: Mutex::new(0),
            free_cv: Condvar::new(),
            dev_sizes: Mutex::new(BTreeMap::new()),
        }
    }

    fn head(&self, id: BufferId) -> Arc<BufferHead> {
        match self.arena.read().get(id) {
            Some(head) => head,
            None => panic!("[BCACHE] buffer {:?} is linked but not allocated", id),
        }
    }

    // ===== 引用计数与空闲等待 =====

    pub(crate) fn put(&self, head: &BufferHead) {
        if head.put() == 0 {
            let mut seq = self.free_seq.lock();
            *seq = seq.wrapping_add(1);
            self.free_cv.notify_all();
        }
    }

    fn free_seq(&self) -> u64 {
        *self.free_seq.lock()
    }

    fn wait_free(&self, seen: u64) {
        let mut seq = self.free_seq.lock();
        if *seq == seen {
            self.free_cv.wait_for(&mut seq, FREE_WAIT_SLICE);
        }
    }

    fn check_device_size(&self, dev: DeviceId, size: u32) -> Result<()> {
        let mut sizes = self.dev_sizes.lock();
        match sizes.get(&dev) {
            Some(&active) if active != size => Err(Error::new(
                ErrorKind::InvalidBlockSize,
                "Block size differs from the device's active block size",
            )),
            Some(_) => Ok(()),
            None => {
                sizes.insert(dev, size);
                Ok(())
            }
        }
    }

    fn devices(&self) -> Vec<DeviceId> {
        let mut devs: BTreeSet<DeviceId> = self.dev_sizes.lock().keys().copied().collect();
        devs.extend(self.hash.read().iter().map(|(_, key)| key.dev));
        devs.into_iter().collect()
    }

    // ===== 查找与创建 =====

    pub(crate) fn lookup(self: &Arc<Self>, key: BlockKey) -> Option<BufferHandle> {
        let hash = self.hash.read();
        let id = hash.lookup(key)?;
        let head = self.head(id);
        head.get();
        drop(hash);
        Some(BufferHandle::adopt(self.clone(), head, key))
    }

    pub(crate) fn get_or_create(self: &Arc<Self>, key: BlockKey, blocking: bool) -> Result<BufferHandle> {
        let class = size_class_index(key.size, self.page_size)?;
        self.check_device_size(key.dev, key.size)?;

        Counters::inc(&self.counters.lookups);
        if let Some(handle) = self.lookup(key) {
            Counters::inc(&self.counters.hits);
            log::trace!("[BCACHE] hit {:?}", key);
            return Ok(handle);
        }
        Counters::inc(&self.counters.misses);
        log::debug!("[BCACHE] miss {:?}", key);

        loop {
            let seen = self.free_seq();
            if let Some(handle) = self.try_install(key, class) {
                return Ok(handle);
            }
            if self.grow(class) || self.recycle_clean(class) || self.reclaim_page(Some(class)) {
                continue;
            }

            // 没有可回收的干净缓冲区：同步写回同大小的脏缓冲区
            self.signal.wake_pressure();
            let max = self.flush.tunables().max_buffers_per_pass as usize;
            let written = self.write_dirty(max, |st| st.key.map_or(false, |k| k.size == key.size));
            if !written.is_empty() && self.wait_all(&written).is_ok() {
                continue;
            }
            drop(written);

            if !blocking {
                return Err(Error::new(
                    ErrorKind::OutOfBuffers,
                    "No free buffer and nothing reclaimable",
                ));
            }
            log::debug!("[BCACHE] waiting for a free {} byte buffer", key.size);
            self.wait_free(seen);
        }
    }

    /// 从空闲链表取一个缓冲区绑定到 `key`
    ///
    /// 在哈希写锁下重新检查：并发插入已经赢得竞争时直接返回已有的缓冲区。
    fn try_install(self: &Arc<Self>, key: BlockKey, class: usize) -> Option<BufferHandle> {
        let mut clean = self.lru.lock(LruClass::Clean);
        let mut hash = self.hash.write();
        if let Some(id) = hash.lookup(key) {
            let head = self.head(id);
            head.get();
            log::trace!("[BCACHE] concurrent insert won for {:?}", key);
            return Some(BufferHandle::adopt(self.clone(), head, key));
        }

        let id = self.free[class].lock().pop_front()?;
        let head = self.head(id);
        head.claim();
        head.state.lock().bind(key, LruClass::Clean);
        hash.insert(id, key);
        clean.push_back(id);
        drop(hash);
        drop(clean);

        log::trace!("[BCACHE] installed {:?} as {:?}", key, id);
        Some(BufferHandle::adopt(self.clone(), head, key))
    }

    /// 分配一页并切分成 `class` 大小的缓冲区
    fn grow(&self, class: usize) -> bool {
        let Some(frame) = self.allocator.alloc_page() else {
            return false;
        };
        let size = class_block_size(class);
        let blocks = frame.split(size as usize);

        let mut free = self.free[class].lock();
        let mut pages = self.pages.lock();
        let page_id = pages.reserve();
        let ids: Vec<BufferId> = {
            let mut arena = self.arena.write();
            blocks
                .into_iter()
                .map(|data| arena.insert_with(|id| BufferHead::new(id, page_id, data)).id())
                .collect()
        };
        for &id in &ids {
            free.push_back(id);
        }
        pages.install(PageBufferMap {
            id: page_id,
            class,
            buffers: ids,
        });

        Counters::inc(&self.counters.grows);
        log::debug!("[BCACHE] grow: page {:?} split into {} byte buffers", page_id, size);
        true
    }

    /// 把一个空闲的干净缓冲区放回它的空闲链表
    fn recycle_clean(&self, class: usize) -> bool {
        let size = class_block_size(class);
        let mut clean = self.lru.lock(LruClass::Clean);
        let mut hash = self.hash.write();

        let victim = clean.iter().find(|&id| {
            let head = self.head(id);
            if head.size() != size || head.use_count() != 0 {
                return false;
            }
            let st = head.state.lock();
            st.lru_class == Some(LruClass::Clean)
                && !st.flags.intersects(BUSY_FLAGS | BufferFlags::PROTECTED)
        });
        let Some(id) = victim else {
            return false;
        };

        clean.remove(id);
        hash.remove(id);
        self.head(id).state.lock().reset_free();
        self.free[class].lock().push_front(id);

        Counters::inc(&self.counters.recycles);
        log::debug!("[BCACHE] recycled {:?} ({} bytes)", id, size);
        true
    }

    /// 回收一整页，其上所有缓冲区都必须空闲
    ///
    /// 优先选择全部在空闲链表上的页，其次是只含空闲干净缓冲区的页。
    /// `skip_class` 的页不参与。
    fn reclaim_page(&self, skip_class: Option<usize>) -> bool {
        let mut lru = self.lru.lock_all();
        let mut hash = self.hash.write();
        let mut free: Vec<_> = self.free.iter().map(|f| f.lock()).collect();
        let mut pages = self.pages.lock();

        let idle = |id: BufferId, unfiled_only: bool| {
            let head = self.head(id);
            if head.use_count() != 0 {
                return false;
            }
            let st = head.state.lock();
            !st.flags.intersects(BUSY_FLAGS | BufferFlags::PROTECTED)
                && (!unfiled_only || st.lru_class.is_none())
        };
        let pick = |unfiled_only: bool| {
            pages
                .iter()
                .filter(|p| Some(p.class) != skip_class)
                .find(|p| p.buffers.iter().all(|&id| idle(id, unfiled_only)))
                .map(|p| p.id)
        };
        let Some(page_id) = pick(true).or_else(|| pick(false)) else {
            return false;
        };
        let Some(page) = pages.remove(page_id) else {
            return false;
        };

        let heads: Vec<_> = page.buffers.iter().map(|&id| self.head(id)).collect();
        for head in &heads {
            let mut st = head.state.lock();
            match st.lru_class {
                Some(class) => {
                    lru.list_mut(class).remove(head.id());
                }
                None => {
                    free[page.class].remove(head.id());
                }
            }
            st.reset_free();
            drop(st);
            hash.remove(head.id());
        }
        {
            let mut arena = self.arena.write();
            for head in &heads {
                arena.remove(head.id());
            }
        }
        let blocks = heads.iter().map(|h| h.take_data()).collect();
        drop(pages);
        drop(free);
        drop(hash);
        drop(lru);

        self.allocator.free_page(PageFrame::assemble(blocks));
        Counters::inc(&self.counters.shrinks);
        log::debug!("[BCACHE] shrink: reclaimed page {:?}", page_id);
        true
    }

    pub(crate) fn shrink(&self, max_pages: usize) -> usize {
        (0..max_pages).take_while(|_| self.reclaim_page(None)).count()
    }

    // ===== I/O =====

    fn start_write(st: &mut BufferState) {
        st.lock_io(IoDirection::Write);
        st.write_seq = Some(st.dirty_seq);
        st.flush_deadline = None;
    }

    fn submit(&self, direction: IoDirection, handles: Vec<BufferHandle>, completion: CompletionKind) {
        if handles.is_empty() {
            return;
        }
        for handle in &handles {
            self.lru.refile(handle.head());
        }
        let counter = match direction {
            IoDirection::Read => &self.counters.reads,
            IoDirection::Write => &self.counters.writebacks,
        };
        Counters::add(counter, handles.len() as u64);

        let requests = handles
            .into_iter()
            .map(|h| IoRequest::new(h, direction, completion.clone()))
            .collect();
        self.driver.submit_block_io(direction, requests);
    }

    /// 一次 I/O 完成
    pub(crate) fn end_io(&self, head: &BufferHead, direction: IoDirection, success: bool) {
        let rearm = Instant::now() + self.flush.tunables().dirty_age(false);
        let (key, cleaned) = {
            let mut st = head.state.lock();
            let mut cleaned = false;
            st.flags.remove(BufferFlags::LOCKED);
            st.io = None;
            if success {
                st.flags.insert(BufferFlags::UPTODATE);
                st.flags.remove(BufferFlags::NEW);
                // 写回期间再次标脏的缓冲区保持为脏
                if direction == IoDirection::Write
                    && st.flags.contains(BufferFlags::DIRTY)
                    && st.write_seq == Some(st.dirty_seq)
                {
                    st.flags.remove(BufferFlags::DIRTY);
                    st.flush_deadline = None;
                    cleaned = true;
                }
            } else {
                st.flags.remove(BufferFlags::UPTODATE);
            }
            if st.flags.contains(BufferFlags::DIRTY) && st.flush_deadline.is_none() {
                st.flush_deadline = Some(rearm);
            }
            st.write_seq = None;
            (st.key, cleaned)
        };

        if cleaned {
            self.flush.account_clean(head.size());
        }
        if !success {
            Counters::inc(&self.counters.io_errors);
            log::warn!("[BCACHE] {:?} of {:?} failed", direction, key);
        }
        self.lru.refile(head);
        head.wake_waiters();
    }

    /// 等待一组缓冲区的 I/O 完成，返回第一个错误
    fn wait_all(&self, handles: &[BufferHandle]) -> Result<()> {
        let mut err = None;
        for handle in handles {
            handle.wait_unlocked();
            let flags = handle.flags();
            if flags.contains(BufferFlags::REQUESTED) && !flags.contains(BufferFlags::UPTODATE) {
                first_error(&mut err, Error::new(ErrorKind::Io, "Buffer I/O failed"));
            }
        }
        err.map_or(Ok(()), Err)
    }

    /// 扫描 Dirty 队列，锁定并提交最多 `max` 个满足 `pred` 的脏缓冲区
    ///
    /// 已在 I/O 中的缓冲区直接跳过，不等待。
    pub(crate) fn write_dirty<P>(self: &Arc<Self>, max: usize, pred: P) -> Vec<BufferHandle>
    where
        P: Fn(&BufferState) -> bool,
    {
        let mut picked = Vec::new();
        let mut scan = DirtyScan::new(self);

        while picked.len() < max {
            let Some((head, list)) = scan.advance(self) else {
                break;
            };
            let key = {
                let mut st = head.state.lock();
                if st.flags.contains(BufferFlags::LOCKED)
                    || !st.flags.contains(BufferFlags::DIRTY)
                    || !pred(&*st)
                {
                    continue;
                }
                let Some(key) = st.key else {
                    continue;
                };
                Self::start_write(&mut st);
                key
            };
            head.get();
            drop(list);
            picked.push(BufferHandle::adopt(self.clone(), head, key));
        }

        if !picked.is_empty() {
            log::debug!("[BCACHE] writing back {} dirty buffers", picked.len());
            self.submit(IoDirection::Write, picked.clone(), CompletionKind::SyncWake);
        }
        picked
    }

    /// 提交期限已到的脏缓冲区
    pub(crate) fn flush_expired(self: &Arc<Self>, now: Instant) -> usize {
        self.write_dirty(usize::MAX, |st| st.flush_deadline.map_or(false, |d| d <= now))
            .len()
    }

    /// 一轮压力刷新：提交最多 `max` 个脏缓冲区并等待完成
    pub(crate) fn flush_dirty(self: &Arc<Self>, max: usize) -> Result<usize> {
        let written = self.write_dirty(max, |_| true);
        self.wait_all(&written)?;
        Ok(written.len())
    }

    fn read_handle(&self, handle: &BufferHandle) -> Result<()> {
        let head = handle.head();
        {
            let mut st = head.state.lock();
            head.wait_unlocked_locked(&mut st);
            if st.flags.contains(BufferFlags::UPTODATE) {
                return Ok(());
            }
            if st.flags.contains(BufferFlags::DIRTY) {
                return Err(Error::new(
                    ErrorKind::Io,
                    "Buffer holds unwritten data from a failed write",
                ));
            }
            st.lock_io(IoDirection::Read);
        }
        self.submit(IoDirection::Read, vec![handle.clone()], CompletionKind::SyncWake);

        let mut st = head.state.lock();
        head.wait_unlocked_locked(&mut st);
        if st.flags.contains(BufferFlags::UPTODATE) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Io, "Block read failed"))
        }
    }

    pub(crate) fn read_through(self: &Arc<Self>, key: BlockKey) -> Result<BufferHandle> {
        let handle = self.get_or_create(key, true)?;
        self.read_handle(&handle)?;
        Ok(handle)
    }

    pub(crate) fn write_buffer(&self, handle: &BufferHandle, wait: bool) -> Result<()> {
        let head = handle.head();
        {
            let mut st = head.state.lock();
            if wait {
                head.wait_unlocked_locked(&mut st);
            } else if st.flags.contains(BufferFlags::LOCKED) {
                return Ok(());
            }
            if !st.flags.contains(BufferFlags::DIRTY) {
                return Ok(());
            }
            Self::start_write(&mut st);
        }
        self.submit(IoDirection::Write, vec![handle.clone()], CompletionKind::SyncWake);

        if wait {
            let mut st = head.state.lock();
            head.wait_unlocked_locked(&mut st);
            if !st.flags.contains(BufferFlags::UPTODATE) {
                return Err(Error::new(ErrorKind::Io, "Block write failed"));
            }
        }
        Ok(())
    }

    /// 锁定需要读入的缓冲区；已在 I/O 中的不等待，留给调用者稍后等待
    fn lock_for_read(handles: &[BufferHandle]) -> Vec<BufferHandle> {
        let mut to_read = Vec::new();
        for handle in handles {
            let mut st = handle.head().state.lock();
            if st.flags.intersects(BufferFlags::LOCKED | BufferFlags::UPTODATE | BufferFlags::DIRTY) {
                continue;
            }
            st.lock_io(IoDirection::Read);
            to_read.push(handle.clone());
        }
        to_read
    }

    fn all_uptodate(&self, handles: &[BufferHandle]) -> Result<()> {
        for handle in handles {
            handle.wait_unlocked();
            if !handle.is_uptodate() {
                return Err(Error::new(ErrorKind::Io, "Block read failed"));
            }
        }
        Ok(())
    }

    /// 一次持有 `count` 个 `size` 大小的缓冲区是否可能
    ///
    /// 批量获取时调用者一直持有先拿到的句柄，超出容量的批次只会等待
    /// 自己释放，永远无法完成。
    fn check_batch(&self, count: usize, size: u32) -> Result<()> {
        let capacity = self.allocator.total_pages() * (self.page_size / size) as usize;
        if count > capacity {
            log::warn!("[BCACHE] batch of {} blocks exceeds {} buffers of {}", count, capacity, size);
            return Err(Error::new(
                ErrorKind::OutOfBuffers,
                "Batch is larger than the cache can hold",
            ));
        }
        Ok(())
    }

    pub(crate) fn read_page(
        self: &Arc<Self>,
        dev: DeviceId,
        page_index: u64,
        size: u32,
    ) -> Result<Vec<BufferHandle>> {
        size_class_index(size, self.page_size)?;
        let per_page = (self.page_size / size) as u64;
        let first = page_index
            .checked_mul(per_page)
            .filter(|first| first.checked_add(per_page).is_some())
            .ok_or(Error::new(ErrorKind::InvalidInput, "Page index out of range"))?;
        self.check_batch(per_page as usize, size)?;
        let handles = (first..first + per_page)
            .map(|block| self.get_or_create(BlockKey::new(dev, block, size), true))
            .collect::<Result<Vec<_>>>()?;

        let to_read = Self::lock_for_read(&handles);
        if !to_read.is_empty() {
            let page = PageIo::new(to_read.len());
            self.submit(
                IoDirection::Read,
                to_read,
                CompletionKind::AsyncPageAggregate(page.clone()),
            );
            page.wait()?;
        }
        self.all_uptodate(&handles)?;
        Ok(handles)
    }

    pub(crate) fn read_vectored(
        self: &Arc<Self>,
        dev: DeviceId,
        blocks: &[u64],
        size: u32,
    ) -> Result<Vec<BufferHandle>> {
        size_class_index(size, self.page_size)?;
        let distinct = blocks.iter().collect::<BTreeSet<_>>().len();
        self.check_batch(distinct, size)?;
        let handles = blocks
            .iter()
            .map(|&block| self.get_or_create(BlockKey::new(dev, block, size), true))
            .collect::<Result<Vec<_>>>()?;

        let to_read = Self::lock_for_read(&handles);
        if !to_read.is_empty() {
            let kio = KioVec::new(to_read.len());
            self.submit(
                IoDirection::Read,
                to_read,
                CompletionKind::KioVecAggregate(kio.clone()),
            );
            kio.wait()?;
        }
        self.all_uptodate(&handles)?;
        Ok(handles)
    }

    pub(crate) fn write_vectored(&self, handles: &[BufferHandle]) -> Result<usize> {
        let mut to_write = Vec::new();
        let mut deferred = Vec::new();
        for handle in handles {
            let mut st = handle.head().state.lock();
            if st.flags.contains(BufferFlags::LOCKED) {
                deferred.push(handle);
            } else if st.flags.contains(BufferFlags::DIRTY) {
                Self::start_write(&mut st);
                to_write.push(handle.clone());
            }
        }

        let mut bytes = 0;
        let mut err = None;
        if !to_write.is_empty() {
            let kio = KioVec::new(to_write.len());
            self.submit(
                IoDirection::Write,
                to_write,
                CompletionKind::KioVecAggregate(kio.clone()),
            );
            match kio.wait() {
                Ok(n) => bytes += n,
                Err(e) => first_error(&mut err, e),
            }
        }
        for handle in deferred {
            handle.wait_unlocked();
            let was_dirty = handle.is_dirty();
            match self.write_buffer(handle, true) {
                Ok(()) if was_dirty => bytes += handle.size() as usize,
                Ok(()) => {}
                Err(e) => first_error(&mut err, e),
            }
        }
        err.map_or(Ok(bytes), Err)
    }

    // ===== 标脏与背压 =====

    pub(crate) fn mark_dirty(self: &Arc<Self>, handle: &BufferHandle, is_metadata: bool) {
        let head = handle.head();
        let deadline = Instant::now() + self.flush.tunables().dirty_age(is_metadata);
        let newly_dirty = {
            let mut st = head.state.lock();
            if st.flags.contains(BufferFlags::NEW) {
                log::warn!("[BCACHE] mark_dirty on uninitialized {:?} ignored", handle.key());
                return;
            }
            st.dirty_seq += 1;
            if st.flags.contains(BufferFlags::DIRTY) {
                false
            } else {
                st.flags.insert(BufferFlags::DIRTY);
                st.flush_deadline = Some(deadline);
                true
            }
        };
        if newly_dirty {
            self.flush.account_dirty(head.size());
            self.lru.refile(head);
        }
        self.balance_dirty(handle.dev());
    }

    fn balance_dirty(self: &Arc<Self>, dev: DeviceId) {
        match self.flush.classify(dev) {
            FlushAction::NoAction => {}
            FlushAction::AsyncFlush => self.signal.wake_pressure(),
            FlushAction::SyncFlush => {
                self.signal.wake_pressure();
                Counters::inc(&self.counters.sync_flushes);
                let max = self.flush.tunables().max_buffers_per_pass as usize;
                if let Err(e) = self.flush_dirty(max) {
                    log::debug!("[BCACHE] synchronous flush for {}: {}", dev, e);
                }
            }
        }
    }

    // ===== 失效与同步 =====

    /// 钉住设备 `dev` 在给定 LRU 类中的全部缓冲区
    fn pin_device(self: &Arc<Self>, dev: DeviceId, classes: &[LruClass]) -> Vec<BufferHandle> {
        let mut pinned = Vec::new();
        for &class in classes {
            let list = self.lru.lock(class);
            for id in list.iter() {
                let head = self.head(id);
                let key = head.key();
                if let Some(key) = key.filter(|k| k.dev == dev) {
                    head.get();
                    pinned.push(BufferHandle::adopt(self.clone(), head, key));
                }
            }
        }
        pinned
    }

    /// 把设备 `dev` 上未被使用的缓冲区放回空闲链表
    ///
    /// `keep_size` 指定时只驱逐其他大小的缓冲区。返回仍被引用或
    /// 仍在 I/O、仍为脏而无法驱逐的缓冲区数量。
    fn evict_device(&self, dev: DeviceId, keep_size: Option<u32>) -> usize {
        let mut lru = self.lru.lock_all();
        let mut hash = self.hash.write();
        let mut free: Vec<_> = self.free.iter().map(|f| f.lock()).collect();
        let mut busy = 0;
        let mut evicted = 0;

        for class in LruClass::ALL {
            let ids: Vec<BufferId> = lru.list(class).iter().collect();
            for id in ids {
                let head = self.head(id);
                if Some(head.size()) == keep_size {
                    continue;
                }
                let mut st = head.state.lock();
                if st.key.map(|k| k.dev) != Some(dev) {
                    continue;
                }
                if head.use_count() != 0 || st.flags.intersects(BUSY_FLAGS) {
                    busy += 1;
                    continue;
                }
                st.reset_free();
                drop(st);
                lru.list_mut(class).remove(id);
                hash.remove(id);
                free[class_index(head.size())].push_front(id);
                evicted += 1;
            }
        }
        log::debug!("[BCACHE] evicted {} buffers of {}, {} busy", evicted, dev, busy);
        busy
    }

    pub(crate) fn invalidate(&self, handle: &BufferHandle) -> bool {
        let head = handle.head();
        let was_dirty = {
            let mut st = head.state.lock();
            if st.flags.contains(BufferFlags::LOCKED) {
                log::warn!("[BCACHE] invalidate of locked {:?} ignored", handle.key());
                return false;
            }
            let was_dirty = st.flags.contains(BufferFlags::DIRTY);
            st.flags
                .remove(BufferFlags::DIRTY | BufferFlags::UPTODATE | BufferFlags::REQUESTED);
            st.flush_deadline = None;
            was_dirty
        };
        if was_dirty {
            self.flush.account_clean(head.size());
        }
        self.lru.refile(head);
        true
    }

    pub(crate) fn invalidate_device(self: &Arc<Self>, dev: DeviceId) {
        let pinned = self.pin_device(dev, &LruClass::ALL);
        let count = pinned.len();
        for handle in &pinned {
            let head = handle.head();
            let was_dirty = {
                let mut st = head.state.lock();
                head.wait_unlocked_locked(&mut st);
                let was_dirty = st.flags.contains(BufferFlags::DIRTY);
                st.flags.remove(
                    BufferFlags::DIRTY
                        | BufferFlags::UPTODATE
                        | BufferFlags::REQUESTED
                        | BufferFlags::PROTECTED,
                );
                st.flush_deadline = None;
                was_dirty
            };
            if was_dirty {
                self.flush.account_clean(head.size());
            }
            self.lru.refile(head);
        }
        drop(pinned);

        let busy = self.evict_device(dev, None);
        log::info!("[BCACHE] invalidated {} buffers of {}, {} still referenced", count, dev, busy);
    }

    pub(crate) fn sync_device(self: &Arc<Self>, dev: DeviceId, wait: bool) -> Result<()> {
        let mut err = None;
        let on_dev = move |st: &BufferState| st.key.map_or(false, |k| k.dev == dev);

        // 第一遍：提交所有未在 I/O 中的脏缓冲区
        let mut touched = self.write_dirty(usize::MAX, on_dev);

        if wait {
            // 第二遍：等待进行中的 I/O，仍为脏的重新写回
            for handle in self.pin_device(dev, &[LruClass::Locked, LruClass::Dirty]) {
                handle.wait_unlocked();
                if handle.is_dirty() {
                    if let Err(e) = self.write_buffer(&handle, true) {
                        first_error(&mut err, e);
                    }
                }
                touched.push(handle);
            }
            // 第三遍：发起过 I/O 却没有变为有效的缓冲区报告错误
            if let Err(e) = self.wait_all(&touched) {
                first_error(&mut err, e);
            }
        }

        if let Err(e) = self.driver.flush_device(dev) {
            first_error(&mut err, e);
        }
        log::debug!(
            "[BCACHE] sync {} (wait={}): {} buffers, {}",
            dev,
            wait,
            touched.len(),
            if err.is_some() { "failed" } else { "ok" }
        );
        err.map_or(Ok(()), Err)
    }

    pub(crate) fn fsync_device(self: &Arc<Self>, dev: DeviceId) -> Result<()> {
        let mut err = None;
        if let Err(e) = self.sync_device(dev, false) {
            first_error(&mut err, e);
        }
        self.fs.sync_superblocks(Some(dev));
        self.fs.sync_inodes(Some(dev));
        if let Err(e) = self.sync_device(dev, false) {
            first_error(&mut err, e);
        }
        if let Err(e) = self.sync_device(dev, true) {
            first_error(&mut err, e);
        }
        err.map_or(Ok(()), Err)
    }

    pub(crate) fn sync_all(self: &Arc<Self>) -> Result<()> {
        self.fs.sync_superblocks(None);
        self.fs.sync_inodes(None);
        let mut err = None;
        for dev in self.devices() {
            if let Err(e) = self.sync_device(dev, true) {
                first_error(&mut err, e);
            }
        }
        err.map_or(Ok(()), Err)
    }

    pub(crate) fn resize_block_size(self: &Arc<Self>, dev: DeviceId, new_size: u32) -> Result<()> {
        size_class_index(new_size, self.page_size)?;
        if let Some(hw) = self.driver.device_block_size(dev) {
            if new_size < hw {
                return Err(Error::new(
                    ErrorKind::InvalidBlockSize,
                    "Block size is smaller than the device's sector size",
                ));
            }
        }

        let old = self.dev_sizes.lock().insert(dev, new_size);
        if old == Some(new_size) {
            return Ok(());
        }
        log::info!("[BCACHE] {} block size {:?} -> {}", dev, old, new_size);

        loop {
            let seen = self.free_seq();
            if let Err(e) = self.sync_device(dev, true) {
                self.restore_block_size(dev, new_size, old);
                return Err(e);
            }
            let busy = self.evict_device(dev, Some(new_size));
            if busy == 0 {
                return Ok(());
            }
            log::debug!("[BCACHE] {} old-size buffers of {} still busy", busy, dev);
            self.wait_free(seen);
        }
    }

    /// 切换失败时退回原来的块大小，除非别人已经又改过
    fn restore_block_size(&self, dev: DeviceId, new_size: u32, old: Option<u32>) {
        let mut sizes = self.dev_sizes.lock();
        if sizes.get(&dev) != Some(&new_size) {
            return;
        }
        match old {
            Some(size) => sizes.insert(dev, size),
            None => sizes.remove(&dev),
        };
        log::warn!("[BCACHE] {} block size change to {} failed, back to {:?}", dev, new_size, old);
    }

    // ===== 统计与自检 =====

    pub(crate) fn stats(&self) -> CacheStats {
        let mut stats = self.counters.snapshot();
        stats.dirty_bytes = self.flush.dirty_bytes();
        stats.allocated_pages = self.allocator.allocated_pages();
        stats.total_pages = self.allocator.total_pages();
        stats.clean_buffers = self.lru.len(LruClass::Clean);
        stats.locked_buffers = self.lru.len(LruClass::Locked);
        stats.dirty_buffers = self.lru.len(LruClass::Dirty);
        stats.free_buffers = self.free.iter().map(|f| f.lock().len()).sum();
        stats.longest_hash_chain = self.hash.read().longest_chain();
        stats
    }

    pub(crate) fn check_invariants(&self) -> Result<()> {
        let invalid = |message| Err(Error::new(ErrorKind::InvalidState, message));

        let lru = self.lru.lock_all();
        let hash = self.hash.read();
        let free: Vec<_> = self.free.iter().map(|f| f.lock()).collect();
        let pages = self.pages.lock();
        let arena = self.arena.read();

        let mut dirty_bytes = 0usize;
        for head in arena.iter() {
            let id = head.id();
            let st = head.state.lock();
            let on_free = free.iter().filter(|f| f.contains(id)).count();
            let filed = LruClass::ALL.iter().filter(|&&c| lru.list(c).contains(id)).count();

            match (st.lru_class, st.key) {
                (Some(class), Some(key)) => {
                    if class != st.class() {
                        return invalid("Buffer filed in the wrong LRU class");
                    }
                    if filed != 1 || !lru.list(class).contains(id) {
                        return invalid("Buffer is not in exactly one LRU class");
                    }
                    if on_free != 0 {
                        return invalid("Cached buffer is also on a free list");
                    }
                    if hash.lookup(key) != Some(id) || key.size != head.size() {
                        return invalid("Hash index does not resolve a cached buffer");
                    }
                }
                (None, None) => {
                    if filed != 0 || hash.contains(id) {
                        return invalid("Free buffer is still cached");
                    }
                    if on_free != 1 || !free[class_index(head.size())].contains(id) {
                        return invalid("Free buffer is not on its size-class free list");
                    }
                    if head.use_count() != 0 {
                        return invalid("Free buffer is still referenced");
                    }
                }
                _ => return invalid("Buffer identity and LRU filing disagree"),
            }
            if st.flags.contains(BufferFlags::DIRTY) {
                dirty_bytes += head.size() as usize;
            }
        }

        let cached: usize = LruClass::ALL.iter().map(|&c| lru.list(c).len()).sum();
        if hash.len() != cached {
            return invalid("Hash index and LRU queues disagree on cached buffers");
        }
        if dirty_bytes != self.flush.dirty_bytes() {
            return invalid("Dirty byte accounting drifted");
        }
        let mut paged = 0;
        for page in pages.iter() {
            let size = class_block_size(page.class);
            if page.buffers.len() != (self.page_size / size) as usize {
                return invalid("Page split into the wrong number of buffers");
            }
            for &id in &page.buffers {
                match arena.get(id) {
                    Some(head) if head.page() == page.id && head.size() == size => {}
                    _ => return invalid("Page buffer map references a foreign buffer"),
                }
            }
            // 同页兄弟环恰好走一圈回到起点
            if let Some(&first) = page.buffers.first() {
                let mut cursor = first;
                for _ in 0..page.buffers.len() {
                    cursor = match page.next_in_page(cursor) {
                        Some(next) => next,
                        None => return invalid("Page sibling ring is broken"),
                    };
                }
                if cursor != first {
                    return invalid("Page sibling ring is broken");
                }
            }
            paged += page.buffers.len();
        }
        if pages.len() != self.allocator.allocated_pages() {
            return invalid("Page table and allocator disagree");
        }
        if paged != arena.len() {
            return invalid("Arena holds buffers outside any page");
        }
        for (class, list) in free.iter().enumerate() {
            if !list.is_empty() && !pages.iter().any(|p| p.class == class) {
                return invalid("Free list holds buffers of a size with no pages");
            }
        }
        Ok(())
    }
}

/// 块缓冲区缓存
///
/// 初始化时按 [`CacheConfig`] 确定内存预算，并启动两个后台刷新线程；
/// [`shutdown`](Self::shutdown)（或 drop）时停止并等待它们退出，再做
/// 最后一次尽力刷新。
///
/// # 示例
///
/// ```rust,ignore
/// use bcache_core::{CacheConfig, CacheManager, DeviceId, MemDevice, SyncDriver};
/// use std::sync::Arc;
///
/// let driver = Arc::new(SyncDriver::new());
/// driver.register(DeviceId(1), MemDevice::new(512, 4096))?;
/// let cache = CacheManager::new(CacheConfig::default(), driver)?;
///
/// let bh = cache.get_or_create(DeviceId(1), 100, 1024)?;
/// bh.write(|data| data[..3].copy_from_slice(b"ABC"));
/// cache.mark_dirty(&bh, false);
/// cache.sync_device(DeviceId(1), true)?;
/// ```
pub struct CacheManager {
    core: Arc<CacheCore>,
    flushers: Mutex<Option<Flushers>>,
}

impl CacheManager {
    /// 创建缓存，使用按页预算分配的内存和空的文件系统回调
    pub fn new(config: CacheConfig, driver: Arc<dyn BlockDriver>) -> Result<Self> {
        Self::with_parts(config, driver, Arc::new(NoFsSync), None)
    }

    /// 创建缓存，指定文件系统回调和（可选的）页分配器
    pub fn with_parts(
        config: CacheConfig,
        driver: Arc<dyn BlockDriver>,
        fs: Arc<dyn FsSync>,
        allocator: Option<Arc<dyn PageAllocator>>,
    ) -> Result<Self> {
        config.validate()?;
        let allocator = allocator.unwrap_or_else(|| {
            Arc::new(BudgetAllocator::new(config.page_size as usize, config.total_pages()))
        });
        if allocator.page_size() != config.page_size as usize {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Page allocator page size differs from the configured page size",
            ));
        }

        let core = Arc::new(CacheCore::new(&config, driver, fs, allocator));
        let flushers = if config.spawn_flushers {
            Some(Flushers::spawn(&core)?)
        } else {
            None
        };
        log::info!(
            "[BCACHE] init: {} pages of {} bytes, {} hash buckets",
            core.allocator.total_pages(),
            config.page_size,
            core.hash.read().bucket_count()
        );
        Ok(Self {
            core,
            flushers: Mutex::new(flushers),
        })
    }

    /// 页大小
    pub fn page_size(&self) -> u32 {
        self.core.page_size
    }

    /// 设备当前的块大小
    pub fn block_size(&self, dev: DeviceId) -> Option<u32> {
        self.core.dev_sizes.lock().get(&dev).copied()
    }

    /// 只查哈希索引，不创建
    pub fn lookup(&self, dev: DeviceId, block: u64, size: u32) -> Option<BufferHandle> {
        self.core.lookup(BlockKey::new(dev, block, size))
    }

    /// 获取块的缓冲区，不存在时创建
    ///
    /// 内存不足且无法回收时阻塞，直到别处释放一个缓冲区。
    pub fn get_or_create(&self, dev: DeviceId, block: u64, size: u32) -> Result<BufferHandle> {
        self.core.get_or_create(BlockKey::new(dev, block, size), true)
    }

    /// 与 `get_or_create` 相同，但内存不足时返回 `OutOfBuffers` 而不阻塞
    pub fn try_get_or_create(&self, dev: DeviceId, block: u64, size: u32) -> Result<BufferHandle> {
        self.core.get_or_create(BlockKey::new(dev, block, size), false)
    }

    /// 获取块的缓冲区，内容无效时从设备读入
    pub fn read_through(&self, dev: DeviceId, block: u64, size: u32) -> Result<BufferHandle> {
        self.core.read_through(BlockKey::new(dev, block, size))
    }

    /// 读入一整页上的全部块
    pub fn read_page(&self, dev: DeviceId, page_index: u64, size: u32) -> Result<Vec<BufferHandle>> {
        self.core.read_page(dev, page_index, size)
    }

    /// 批量读入多个块，一次提交、一次等待
    pub fn read_vectored(&self, dev: DeviceId, blocks: &[u64], size: u32) -> Result<Vec<BufferHandle>> {
        self.core.read_vectored(dev, blocks, size)
    }

    /// 批量写回一组缓冲区，返回写回的字节数
    pub fn write_vectored(&self, handles: &[BufferHandle]) -> Result<usize> {
        self.core.write_vectored(handles)
    }

    /// 标脏
    ///
    /// 脏数据比例超过硬阈值时，调用者在这里同步写回一批脏缓冲区。
    pub fn mark_dirty(&self, handle: &BufferHandle, is_metadata: bool) {
        self.core.mark_dirty(handle, is_metadata);
    }

    /// 释放句柄，等同于 drop
    pub fn release(&self, handle: BufferHandle) {
        drop(handle);
    }

    /// 写回单个缓冲区
    pub fn write_buffer(&self, handle: &BufferHandle, wait: bool) -> Result<()> {
        self.core.write_buffer(handle, wait)
    }

    /// 使单个缓冲区失效；缓冲区正在 I/O 时不做处理并返回 `false`
    pub fn invalidate(&self, handle: &BufferHandle) -> bool {
        self.core.invalidate(handle)
    }

    /// 使设备的全部缓冲区失效
    ///
    /// 正在 I/O 的缓冲区会等待其完成；未被引用的缓冲区放回空闲链表。
    pub fn invalidate_device(&self, dev: DeviceId) {
        self.core.invalidate_device(dev);
    }

    /// 写回设备的脏缓冲区，`wait` 时等待全部完成并报告第一个 I/O 错误
    pub fn sync_device(&self, dev: DeviceId, wait: bool) -> Result<()> {
        self.core.sync_device(dev, wait)
    }

    /// fsync 式同步：缓冲区、超级块、inode，再等待缓冲区
    pub fn fsync_device(&self, dev: DeviceId) -> Result<()> {
        self.core.fsync_device(dev)
    }

    /// 同步全部设备
    pub fn sync_all(&self) -> Result<()> {
        self.core.sync_all()
    }

    /// 改变设备的块大小
    ///
    /// 先同步并等待旧大小的缓冲区，再把它们驱逐；返回后该设备不再有
    /// 旧大小的缓冲区。同步失败时设备退回原来的块大小，未写回的旧缓冲区
    /// 仍留在缓存中；期间已按新大小创建的缓冲区不受影响。
    pub fn resize_block_size(&self, dev: DeviceId, new_size: u32) -> Result<()> {
        self.core.resize_block_size(dev, new_size)
    }

    /// 回收最多 `max_pages` 个完全空闲的页，返回回收的页数
    pub fn shrink(&self, max_pages: usize) -> usize {
        self.core.shrink(max_pages)
    }

    /// 提交期限不晚于 `now` 的脏缓冲区，返回提交数
    pub fn flush_expired(&self, now: Instant) -> usize {
        self.core.flush_expired(now)
    }

    /// 写回最多 `max` 个脏缓冲区并等待完成
    pub fn flush_dirty(&self, max: usize) -> Result<usize> {
        self.core.flush_dirty(max)
    }

    /// 设备 `dev` 的写入者此刻应采取的刷新动作
    pub fn classify(&self, dev: DeviceId) -> FlushAction {
        self.core.flush.classify(dev)
    }

    /// 当前可调参数
    pub fn tunables(&self) -> Tunables {
        self.core.flush.tunables()
    }

    /// 修改可调参数，越界时返回 `InvalidInput`
    pub fn set_tunable(&self, param: TunableParam, value: u64) -> Result<()> {
        self.core.flush.set_tunable(param, value)?;
        log::info!("[BCACHE] tunable {:?} = {}", param, value);
        if param == TunableParam::FlushInterval {
            self.core.signal.reconfigure();
        }
        Ok(())
    }

    /// 统计信息快照
    pub fn stats(&self) -> CacheStats {
        self.core.stats()
    }

    /// 在全部结构锁下检查索引、LRU 与脏数据计数的一致性
    pub fn check_invariants(&self) -> Result<()> {
        self.core.check_invariants()
    }

    /// 停止后台刷新线程并做最后一次刷新
    ///
    /// 可以重复调用；之后缓存仍可同步使用。
    pub fn shutdown(&self) {
        let Some(flushers) = self.flushers.lock().take() else {
            return;
        };
        flushers.stop();
        if let Err(e) = self.core.sync_all() {
            log::warn!("[BCACHE] final flush failed: {}", e);
        }
        log::info!("[BCACHE] shutdown complete");
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
