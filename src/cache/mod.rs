//! 块缓冲区缓存
//!
//! 以 `(device, block, size)` 为键、按页分配内存的写回缓存。
//!
//! # 主要组件
//!
//! - [`BufferHead`] - 单个缓冲区：身份、状态标志、引用计数和数据
//! - [`BufferHandle`] - 缓冲区的 RAII 引用
//! - [`CacheManager`] - 获取、读取、标脏、同步、失效等全部操作的入口
//! - [`PageAllocator`] - 缓存使用的页分配器接口
//! - [`IoRequest`] / [`CompletionKind`] - 交给块驱动的 I/O 请求与完成行为
//! - [`CacheStats`] - 缓存统计信息
//!
//! # 数据结构
//!
//! | 结构              | 作用                                   | 锁                   |
//! |-------------------|----------------------------------------|----------------------|
//! | arena             | 按 [`BufferId`] 存放全部缓冲区头       | 读写锁               |
//! | 哈希索引          | `(device, block) → BufferId`           | 读写锁               |
//! | 空闲链表          | 每个大小类一条，未绑定的缓冲区         | 每个大小类一把互斥锁 |
//! | 页表              | 页与其上缓冲区的对应关系               | 互斥锁               |
//! | LRU 队列          | Clean / Locked / Dirty 三个类          | 每类一把互斥锁       |
//!
//! 链表和哈希链都只保存 [`BufferId`]，不保存指针。
//!
//! # 缓冲区状态
//!
//! ```text
//! Free ──get_or_create──▶ Clean ──mark_dirty──▶ Dirty
//!                           ▲  │                  │
//!                           │  └─read──▶ Locked   │ write（Dirty + LOCKED）
//!                           │            │        │
//!                           └────────────┴────────┘ 完成
//! ```
//!
//! 写回完成时，只有在提交之后没有再次标脏的情况下才清除 `DIRTY`。
//!
//! # 使用示例
//!
//! ```rust,ignore
//! let bh = cache.read_through(dev, 100, 1024)?;
//! bh.write(|data| data[0] = 42);
//! cache.mark_dirty(&bh, false);
//! drop(bh);
//!
//! cache.sync_device(dev, true)?;
//! println!("hit rate {:.2}", cache.stats().hit_rate());
//! ```

mod arena;
mod buffer;
mod handle;
mod hash;
mod io;
mod list;
mod lru;
pub(crate) mod manager;
mod page;
mod stats;

pub use buffer::{BufferFlags, BufferHead, BufferId, LruClass};
pub use handle::BufferHandle;
pub use io::{CompletionKind, IoRequest, KioVec, PageIo};
pub use manager::CacheManager;
pub use page::{BudgetAllocator, PageAllocator, PageFrame, PageId};
pub use stats::CacheStats;
