//! 缓存使用的基础类型
//!
//! 块身份 `(device, block, size)`、I/O 方向以及大小类换算。

use crate::consts::MIN_BLOCK_SIZE;
use crate::error::{Error, ErrorKind, Result};
use core::fmt;

/// 设备标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// 缓存块的身份：设备、块号、块大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// 设备
    pub dev: DeviceId,
    /// 块号（以 `size` 为单位）
    pub block: u64,
    /// 块大小（字节）
    pub size: u32,
}

impl BlockKey {
    /// 创建块身份
    pub const fn new(dev: DeviceId, block: u64, size: u32) -> Self {
        Self { dev, block, size }
    }

    /// 块在设备上的字节偏移
    pub fn byte_offset(&self) -> u64 {
        self.block * self.size as u64
    }
}

/// I/O 方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// 从设备读入缓冲区
    Read,
    /// 把缓冲区写回设备
    Write,
}

/// 校验块大小并返回其大小类下标
///
/// 大小类为 512 字节到 `page_size` 之间的 2 的幂，下标 0 对应 512。
pub fn size_class_index(size: u32, page_size: u32) -> Result<usize> {
    if !size.is_power_of_two() || size < MIN_BLOCK_SIZE || size > page_size {
        return Err(Error::new(
            ErrorKind::InvalidBlockSize,
            "Block size must be a power of two between 512 and the page size",
        ));
    }
    Ok((size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize)
}

/// 大小类数量
pub fn size_class_count(page_size: u32) -> usize {
    (page_size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize + 1
}

/// 大小类下标对应的块大小
pub fn class_block_size(class: usize) -> u32 {
    MIN_BLOCK_SIZE << class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class_index(512, 4096).unwrap(), 0);
        assert_eq!(size_class_index(1024, 4096).unwrap(), 1);
        assert_eq!(size_class_index(4096, 4096).unwrap(), 3);
        assert_eq!(size_class_count(4096), 4);
        assert_eq!(class_block_size(2), 2048);
    }

    #[test]
    fn test_invalid_sizes() {
        for size in [0, 256, 1000, 8192] {
            let err = size_class_index(size, 4096).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidBlockSize);
        }
    }

    #[test]
    fn test_byte_offset() {
        let key = BlockKey::new(DeviceId(1), 100, 1024);
        assert_eq!(key.byte_offset(), 102_400);
    }
}
