//! 以缓冲区下标链接的双向链表
//!
//! 空闲链表和三个 LRU 类都使用它。链接字段按 [`BufferId`] 存放在链表自身
//! 的 `links` 数组中，由持有链表的锁保护，插入、删除都是 O(1)。

use super::buffer::BufferId;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<BufferId>,
    next: Option<BufferId>,
    linked: bool,
}

/// 下标链表
#[derive(Debug, Default)]
pub(crate) struct IdList {
    head: Option<BufferId>,
    tail: Option<BufferId>,
    len: usize,
    links: Vec<Link>,
    /// 表头每变化一次加一，供无锁遍历检测表头被替换
    head_generation: u64,
}

impl IdList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, id: BufferId) -> &mut Link {
        let idx = id.index();
        if idx >= self.links.len() {
            self.links.resize(idx + 1, Link::default());
        }
        &mut self.links[idx]
    }

    fn set_head(&mut self, head: Option<BufferId>) {
        if self.head != head {
            self.head = head;
            self.head_generation = self.head_generation.wrapping_add(1);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn front(&self) -> Option<BufferId> {
        self.head
    }

    pub(crate) fn head_generation(&self) -> u64 {
        self.head_generation
    }

    pub(crate) fn contains(&self, id: BufferId) -> bool {
        self.links.get(id.index()).map_or(false, |l| l.linked)
    }

    /// `id` 的后继；`id` 不在链表中时返回 `None`
    pub(crate) fn next(&self, id: BufferId) -> Option<BufferId> {
        self.links
            .get(id.index())
            .filter(|l| l.linked)
            .and_then(|l| l.next)
    }

    /// 追加到表尾
    pub(crate) fn push_back(&mut self, id: BufferId) {
        assert!(!self.contains(id), "buffer {:?} already linked", id);
        let tail = self.tail;
        *self.slot(id) = Link {
            prev: tail,
            next: None,
            linked: true,
        };
        match tail {
            Some(t) => self.slot(t).next = Some(id),
            None => self.set_head(Some(id)),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// 插入到表头
    pub(crate) fn push_front(&mut self, id: BufferId) {
        assert!(!self.contains(id), "buffer {:?} already linked", id);
        let head = self.head;
        *self.slot(id) = Link {
            prev: None,
            next: head,
            linked: true,
        };
        match head {
            Some(h) => self.slot(h).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.set_head(Some(id));
        self.len += 1;
    }

    /// 摘除 `id`，不在链表中时什么也不做
    pub(crate) fn remove(&mut self, id: BufferId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let Link { prev, next, .. } = *self.slot(id);
        match prev {
            Some(p) => self.slot(p).next = next,
            None => self.set_head(next),
        }
        match next {
            Some(n) => self.slot(n).prev = prev,
            None => self.tail = prev,
        }
        *self.slot(id) = Link::default();
        self.len -= 1;
        true
    }

    pub(crate) fn pop_front(&mut self) -> Option<BufferId> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    /// 从表头到表尾遍历
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }
}

pub(crate) struct Iter<'a> {
    list: &'a IdList,
    cursor: Option<BufferId>,
}

impl Iterator for Iter<'_> {
    type Item = BufferId;

    fn next(&mut self) -> Option<BufferId> {
        let id = self.cursor?;
        self.cursor = self.list.next(id);
        Some(id)
    }
}
