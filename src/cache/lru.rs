//! LRU 队列
//!
//! 三个 LRU 类（Clean / Locked / Dirty）各自一把锁。需要同时持有多个类时，
//! 一律按 `Clean → Locked → Dirty` 的顺序加锁；LRU 锁整体在哈希锁之外。
//!
//! 新进入某个类的缓冲区总是追加到表尾，因此 Dirty 类按变脏的先后排列，
//! 表头是最早变脏的缓冲区。

use super::buffer::{BufferHead, LruClass};
use super::list::IdList;
use parking_lot::{Mutex, MutexGuard};

pub(crate) struct LruQueues {
    classes: [Mutex<IdList>; 3],
}

/// 同时持有全部三个 LRU 类的锁
pub(crate) struct AllLru<'a> {
    guards: [MutexGuard<'a, IdList>; 3],
}

impl AllLru<'_> {
    pub(crate) fn list(&self, class: LruClass) -> &IdList {
        &self.guards[class.index()]
    }

    pub(crate) fn list_mut(&mut self, class: LruClass) -> &mut IdList {
        &mut self.guards[class.index()]
    }
}

impl LruQueues {
    pub(crate) fn new() -> Self {
        Self {
            classes: [
                Mutex::new(IdList::new()),
                Mutex::new(IdList::new()),
                Mutex::new(IdList::new()),
            ],
        }
    }

    pub(crate) fn lock(&self, class: LruClass) -> MutexGuard<'_, IdList> {
        self.classes[class.index()].lock()
    }

    pub(crate) fn lock_all(&self) -> AllLru<'_> {
        let clean = self.classes[0].lock();
        let locked = self.classes[1].lock();
        let dirty = self.classes[2].lock();
        AllLru {
            guards: [clean, locked, dirty],
        }
    }

    pub(crate) fn len(&self, class: LruClass) -> usize {
        self.lock(class).len()
    }

    /// 把缓冲区移到其标志所对应的 LRU 类的表尾
    ///
    /// 不在任何类中的缓冲区（空闲或安装中）不处理。两个类按固定顺序加锁，
    /// 拿到锁后重新检查状态，期间状态若被别人改动则重试。
    pub(crate) fn refile(&self, head: &BufferHead) {
        loop {
            let (from, want) = {
                let st = head.state.lock();
                match st.lru_class {
                    Some(from) => (from, st.class()),
                    None => return,
                }
            };
            if from == want {
                return;
            }

            let (lo, hi) = if from < want { (from, want) } else { (want, from) };
            let mut lo_guard = self.lock(lo);
            let mut hi_guard = self.lock(hi);
            let mut st = head.state.lock();
            if st.lru_class != Some(from) || st.class() != want {
                continue;
            }
            let (src, dst) = if from == lo {
                (&mut *lo_guard, &mut *hi_guard)
            } else {
                (&mut *hi_guard, &mut *lo_guard)
            };
            src.remove(head.id());
            dst.push_back(head.id());
            st.lru_class = Some(want);
            log::trace!("[BCACHE] refile {:?} {:?} -> {:?}", head.id(), from, want);
            return;
        }
    }
}
