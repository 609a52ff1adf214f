//! 哈希索引
//!
//! `(device, block) → BufferId` 的拉链哈希表。桶数是 2 的幂，初始化时按
//! 缓存内存大小确定，运行期间不做 rehash：索引只是加速查找，未命中时会
//! 落到慢路径重新创建，不会丢数据。
//!
//! 链上的 `next` 字段按 `BufferId` 存在 `entries` 中，和链表一样不使用指针。

use super::buffer::BufferId;
use crate::consts::{BUFFERS_PER_BUCKET, MAX_HASH_BUCKETS, MIN_BLOCK_SIZE, MIN_HASH_BUCKETS};
use crate::types::{BlockKey, DeviceId};

#[derive(Debug, Clone, Copy)]
struct HashEntry {
    key: BlockKey,
    next: Option<BufferId>,
}

/// 哈希索引
#[derive(Debug)]
pub(crate) struct HashIndex {
    buckets: Vec<Option<BufferId>>,
    entries: Vec<Option<HashEntry>>,
    shift: u32,
    len: usize,
}

impl HashIndex {
    /// 创建 `buckets` 个桶的索引，`buckets` 必须是 2 的幂
    pub(crate) fn new(buckets: usize) -> Self {
        assert!(buckets.is_power_of_two());
        Self {
            buckets: vec![None; buckets],
            entries: Vec::new(),
            shift: 64 - buckets.trailing_zeros(),
            len: 0,
        }
    }

    /// 按缓存内存选择桶数
    pub(crate) fn buckets_for_memory(total_memory: usize) -> usize {
        let max_buffers = total_memory / MIN_BLOCK_SIZE as usize;
        (max_buffers / BUFFERS_PER_BUCKET)
            .max(1)
            .next_power_of_two()
            .clamp(MIN_HASH_BUCKETS, MAX_HASH_BUCKETS)
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn bucket_of(&self, dev: DeviceId, block: u64) -> usize {
        if self.buckets.len() == 1 {
            return 0;
        }
        let mixed = (dev.0 as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .rotate_left(29)
            ^ block.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        (mixed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> self.shift) as usize
    }

    fn entry(&self, id: BufferId) -> Option<&HashEntry> {
        self.entries.get(id.index()).and_then(|e| e.as_ref())
    }

    /// 查找块
    pub(crate) fn lookup(&self, key: BlockKey) -> Option<BufferId> {
        let mut cursor = self.buckets[self.bucket_of(key.dev, key.block)];
        while let Some(id) = cursor {
            let entry = self.entry(id)?;
            if entry.key == key {
                return Some(id);
            }
            cursor = entry.next;
        }
        None
    }

    /// `id` 是否已索引
    pub(crate) fn contains(&self, id: BufferId) -> bool {
        self.entry(id).is_some()
    }

    /// 插入到桶链头部；`id` 必须尚未索引
    pub(crate) fn insert(&mut self, id: BufferId, key: BlockKey) {
        assert!(!self.contains(id), "buffer {:?} already hashed", id);
        let bucket = self.bucket_of(key.dev, key.block);
        if id.index() >= self.entries.len() {
            self.entries.resize(id.index() + 1, None);
        }
        self.entries[id.index()] = Some(HashEntry {
            key,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(id);
        self.len += 1;
    }

    /// 从桶链摘除，不存在时什么也不做
    pub(crate) fn remove(&mut self, id: BufferId) -> bool {
        let Some(entry) = self.entry(id).copied() else {
            return false;
        };
        let bucket = self.bucket_of(entry.key.dev, entry.key.block);
        if self.buckets[bucket] == Some(id) {
            self.buckets[bucket] = entry.next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(cur) = cursor {
                let next = self.entry(cur).and_then(|e| e.next);
                if next == Some(id) {
                    if let Some(Some(prev)) = self.entries.get_mut(cur.index()) {
                        prev.next = entry.next;
                    }
                    break;
                }
                cursor = next;
            }
        }
        self.entries[id.index()] = None;
        self.len -= 1;
        true
    }

    /// 最长桶链长度
    pub(crate) fn longest_chain(&self) -> usize {
        self.buckets
            .iter()
            .map(|head| {
                let mut n = 0;
                let mut cursor = *head;
                while let Some(id) = cursor {
                    n += 1;
                    cursor = self.entry(id).and_then(|e| e.next);
                }
                n
            })
            .max()
            .unwrap_or(0)
    }

    /// 全部已索引的 `(id, key)`
    pub(crate) fn iter(&self) -> impl Iterator<Item = (BufferId, BlockKey)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, e)| e.map(|e| (BufferId(idx as u32), e.key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(block: u64) -> BlockKey {
        BlockKey::new(DeviceId(1), block, 1024)
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut index = HashIndex::new(64);
        for i in 0..100 {
            index.insert(BufferId(i), key(i as u64));
        }
        assert_eq!(index.len(), 100);
        for i in 0..100 {
            assert_eq!(index.lookup(key(i as u64)), Some(BufferId(i)));
        }

        assert!(index.remove(BufferId(50)));
        assert!(!index.remove(BufferId(50)));
        assert_eq!(index.lookup(key(50)), None);
        assert_eq!(index.lookup(key(51)), Some(BufferId(51)));
        assert_eq!(index.len(), 99);
    }

    #[test]
    fn test_size_is_part_of_key() {
        let mut index = HashIndex::new(64);
        index.insert(BufferId(0), key(7));
        assert_eq!(index.lookup(BlockKey::new(DeviceId(1), 7, 2048)), None);
        assert_eq!(index.lookup(BlockKey::new(DeviceId(2), 7, 1024)), None);
    }

    #[test]
    fn test_chain_removal_in_single_bucket() {
        let mut index = HashIndex::new(1);
        for i in 0..5 {
            index.insert(BufferId(i), key(i as u64));
        }
        assert_eq!(index.longest_chain(), 5);
        index.remove(BufferId(2));
        index.remove(BufferId(4));
        index.remove(BufferId(0));
        assert_eq!(index.longest_chain(), 2);
        assert_eq!(index.lookup(key(1)), Some(BufferId(1)));
        assert_eq!(index.lookup(key(3)), Some(BufferId(3)));
    }

    #[test]
    fn test_buckets_scale_with_memory() {
        assert_eq!(HashIndex::buckets_for_memory(4096), MIN_HASH_BUCKETS);
        let big = HashIndex::buckets_for_memory(64 * 1024 * 1024);
        assert!(big.is_power_of_two());
        assert!(big > MIN_HASH_BUCKETS);
    }
}
