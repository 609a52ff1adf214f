//! 缓冲区头 arena
//!
//! 所有 [`BufferHead`] 都存放在这里，以稳定的 [`BufferId`] 寻址。页回收时
//! 槽位被清空并可复用；链表和哈希链只保存下标，不保存指针。

use super::buffer::{BufferHead, BufferId};
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Option<Arc<BufferHead>>>,
    vacant: Vec<u32>,
    live: usize,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 分配一个槽位并用 `f` 构造缓冲区头
    pub(crate) fn insert_with(&mut self, f: impl FnOnce(BufferId) -> BufferHead) -> Arc<BufferHead> {
        let id = match self.vacant.pop() {
            Some(idx) => BufferId(idx),
            None => {
                self.slots.push(None);
                BufferId((self.slots.len() - 1) as u32)
            }
        };
        let head = Arc::new(f(id));
        self.slots[id.index()] = Some(head.clone());
        self.live += 1;
        head
    }

    pub(crate) fn get(&self, id: BufferId) -> Option<Arc<BufferHead>> {
        self.slots.get(id.index()).and_then(|slot| slot.clone())
    }

    /// 清空槽位
    pub(crate) fn remove(&mut self, id: BufferId) -> Option<Arc<BufferHead>> {
        let head = self.slots.get_mut(id.index())?.take()?;
        self.vacant.push(id.0);
        self.live -= 1;
        Some(head)
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<BufferHead>> {
        self.slots.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::page::PageId;

    fn make(arena: &mut Arena) -> Arc<BufferHead> {
        arena.insert_with(|id| BufferHead::new(id, PageId(0), vec![0u8; 512].into_boxed_slice()))
    }

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = make(&mut arena);
        let b = make(&mut arena);
        assert_eq!(a.id(), BufferId(0));
        assert_eq!(b.id(), BufferId(1));
        assert_eq!(arena.len(), 2);

        assert!(arena.remove(a.id()).is_some());
        assert!(arena.get(a.id()).is_none());
        assert!(arena.remove(a.id()).is_none());

        // 空槽位被复用
        let c = make(&mut arena);
        assert_eq!(c.id(), BufferId(0));
        assert_eq!(arena.iter().count(), 2);
    }
}
