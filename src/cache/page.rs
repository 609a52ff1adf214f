//! 页与缓冲区的聚合
//!
//! 一个物理页被切分成 `page_size / size` 个同样大小的缓冲区，组成一个
//! [`PageBufferMap`]。页是回收的最小单位：只有当页上所有缓冲区都空闲时，
//! 整页才会被一起释放，绝不会单独销毁其中一个缓冲区。
//!
//! 页内存来自 [`PageAllocator`]，缓存只把它当作不透明的页分配器使用。

use super::buffer::BufferId;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 页在页表中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub(crate) u32);

/// 一页物理内存
pub struct PageFrame {
    bytes: Box<[u8]>,
}

impl core::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageFrame").field("len", &self.bytes.len()).finish()
    }
}

impl PageFrame {
    /// 分配一页清零的内存
    pub fn zeroed(page_size: usize) -> Self {
        Self {
            bytes: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// 页大小
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// 页是否为空
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 切分成 `size` 字节的块
    pub(crate) fn split(self, size: usize) -> Vec<Box<[u8]>> {
        self.bytes.chunks_exact(size).map(Box::from).collect()
    }

    /// 把回收的块重新拼成一页
    pub(crate) fn assemble(blocks: Vec<Box<[u8]>>) -> Self {
        Self {
            bytes: blocks.concat().into_boxed_slice(),
        }
    }
}

/// 页分配器
///
/// 实现此 trait 以接入外部的内存管理。`alloc_page` 返回 `None` 表示内存
/// 耗尽，缓存会转而回收或施加背压。
pub trait PageAllocator: Send + Sync {
    /// 页大小（字节）
    fn page_size(&self) -> usize;

    /// 缓存最多可使用的页数
    fn total_pages(&self) -> usize;

    /// 已分配的页数
    fn allocated_pages(&self) -> usize;

    /// 分配一页
    fn alloc_page(&self) -> Option<PageFrame>;

    /// 归还一页
    fn free_page(&self, frame: PageFrame);
}

/// 按页预算分配的默认分配器
#[derive(Debug)]
pub struct BudgetAllocator {
    page_size: usize,
    total_pages: usize,
    allocated: AtomicUsize,
}

impl BudgetAllocator {
    /// 创建最多分配 `total_pages` 页的分配器
    pub fn new(page_size: usize, total_pages: usize) -> Self {
        Self {
            page_size,
            total_pages,
            allocated: AtomicUsize::new(0),
        }
    }
}

impl PageAllocator for BudgetAllocator {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn total_pages(&self) -> usize {
        self.total_pages
    }

    fn allocated_pages(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    fn alloc_page(&self) -> Option<PageFrame> {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.total_pages).then_some(n + 1)
            })
            .ok()?;
        Some(PageFrame::zeroed(self.page_size))
    }

    fn free_page(&self, frame: PageFrame) {
        debug_assert_eq!(frame.len(), self.page_size);
        let prev = self.allocated.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "page freed more times than allocated");
    }
}

/// 一个页上的缓冲区集合
///
/// `buffers` 按页内偏移排列，`next_in_page` 沿它循环。
#[derive(Debug)]
pub(crate) struct PageBufferMap {
    pub(crate) id: PageId,
    pub(crate) class: usize,
    pub(crate) buffers: Vec<BufferId>,
}

impl PageBufferMap {
    /// 同页上 `id` 之后的兄弟缓冲区（循环）
    pub(crate) fn next_in_page(&self, id: BufferId) -> Option<BufferId> {
        let pos = self.buffers.iter().position(|b| *b == id)?;
        Some(self.buffers[(pos + 1) % self.buffers.len()])
    }
}

/// 页表
#[derive(Debug, Default)]
pub(crate) struct PageTable {
    pages: Vec<Option<PageBufferMap>>,
    vacant: Vec<u32>,
    live: usize,
}

impl PageTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 预留一个页下标
    pub(crate) fn reserve(&mut self) -> PageId {
        match self.vacant.pop() {
            Some(idx) => PageId(idx),
            None => {
                self.pages.push(None);
                PageId((self.pages.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn install(&mut self, page: PageBufferMap) {
        let idx = page.id.0 as usize;
        debug_assert!(self.pages[idx].is_none());
        self.pages[idx] = Some(page);
        self.live += 1;
    }

    pub(crate) fn remove(&mut self, id: PageId) -> Option<PageBufferMap> {
        let page = self.pages.get_mut(id.0 as usize)?.take()?;
        self.vacant.push(id.0);
        self.live -= 1;
        Some(page)
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PageBufferMap> {
        self.pages.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhaustion() {
        let alloc = BudgetAllocator::new(4096, 2);
        let a = alloc.alloc_page().unwrap();
        let _b = alloc.alloc_page().unwrap();
        assert!(alloc.alloc_page().is_none());
        assert_eq!(alloc.allocated_pages(), 2);

        alloc.free_page(a);
        assert_eq!(alloc.allocated_pages(), 1);
        assert!(alloc.alloc_page().is_some());
    }

    #[test]
    fn test_split_and_assemble() {
        let frame = PageFrame::zeroed(4096);
        let blocks = frame.split(1024);
        assert_eq!(blocks.len(), 4);
        assert!(blocks.iter().all(|b| b.len() == 1024));
        let frame = PageFrame::assemble(blocks);
        assert_eq!(frame.len(), 4096);
    }

    #[test]
    fn test_next_in_page_is_circular() {
        let page = PageBufferMap {
            id: PageId(0),
            class: 1,
            buffers: vec![BufferId(4), BufferId(5), BufferId(6)],
        };
        assert_eq!(page.next_in_page(BufferId(4)), Some(BufferId(5)));
        assert_eq!(page.next_in_page(BufferId(6)), Some(BufferId(4)));
        assert_eq!(page.next_in_page(BufferId(9)), None);
    }

    #[test]
    fn test_page_table_reuses_slots() {
        let mut table = PageTable::new();
        let id = table.reserve();
        table.install(PageBufferMap {
            id,
            class: 0,
            buffers: vec![],
        });
        assert_eq!(table.len(), 1);
        assert!(table.remove(id).is_some());
        assert_eq!(table.reserve(), id);
    }
}
