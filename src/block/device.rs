//! 块设备核心类型

use crate::error::{Error, ErrorKind, Result};

/// 块设备接口
///
/// 实现此 trait 以提供底层块设备访问。设备按扇区寻址，缓存中的块大小
/// 由 [`BlockDev`] 换算成扇区。
///
/// # 示例
///
/// ```rust,ignore
/// use bcache_core::{BlockDevice, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockDevice for MyDevice {
///     fn sector_size(&self) -> u32 {
///         512
///     }
///
///     fn total_sectors(&self) -> u64 {
///         1000000
///     }
///
///     fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
///         // 实现扇区读取
///         Ok(count as usize * self.sector_size() as usize)
///     }
///
///     fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
///         // 实现扇区写入
///         Ok(count as usize * self.sector_size() as usize)
///     }
/// }
/// ```
pub trait BlockDevice: Send {
    /// 物理扇区大小（通常 512）
    fn sector_size(&self) -> u32;

    /// 总扇区数
    fn total_sectors(&self) -> u64;

    /// 读取扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要读取的扇区数
    /// * `buf` - 目标缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际读取的字节数
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize>;

    /// 写入扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要写入的扇区数
    /// * `buf` - 源缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际写入的字节数
    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize>;

    /// 刷新设备缓存
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn total_sectors(&self) -> u64 {
        (**self).total_sectors()
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        (**self).read_blocks(lba, count, buf)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        (**self).write_blocks(lba, count, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

/// 块设备包装器
///
/// 把 `(block, size)` 换算成分区内的扇区地址，并统计物理读写次数。
/// 本身不包含锁，由驱动负责串行化访问。
pub struct BlockDev<D> {
    /// 底层设备
    device: D,
    /// 分区偏移（字节）
    partition_offset: u64,
    /// 分区大小（字节）
    partition_size: u64,
    /// 物理读取次数
    physical_read_count: u64,
    /// 物理写入次数
    physical_write_count: u64,
}

impl<D: BlockDevice> BlockDev<D> {
    /// 包装整个设备
    pub fn new(device: D) -> Self {
        let partition_size = device.total_sectors() * device.sector_size() as u64;
        Self {
            device,
            partition_offset: 0,
            partition_size,
            physical_read_count: 0,
            physical_write_count: 0,
        }
    }

    /// 包装设备上的一个分区
    ///
    /// # 参数
    ///
    /// * `device` - 底层块设备
    /// * `offset` - 分区起始偏移（字节，按扇区对齐）
    /// * `size` - 分区大小（字节）
    pub fn new_partition(device: D, offset: u64, size: u64) -> Result<Self> {
        let sector_size = device.sector_size() as u64;
        let device_size = device.total_sectors() * sector_size;
        if offset % sector_size != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Partition offset must be sector aligned",
            ));
        }
        if offset.checked_add(size).map_or(true, |end| end > device_size) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Partition extends beyond the device",
            ));
        }
        let mut bd = Self::new(device);
        bd.partition_offset = offset;
        bd.partition_size = size;
        Ok(bd)
    }

    /// 获取底层设备的引用
    pub fn device(&self) -> &D {
        &self.device
    }

    /// 获取底层设备的可变引用
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// 获取物理扇区大小
    pub fn sector_size(&self) -> u32 {
        self.device.sector_size()
    }

    /// 获取分区偏移
    pub fn partition_offset(&self) -> u64 {
        self.partition_offset
    }

    /// 获取分区大小
    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    /// 获取物理读取次数
    pub fn physical_read_count(&self) -> u64 {
        self.physical_read_count
    }

    /// 获取物理写入次数
    pub fn physical_write_count(&self) -> u64 {
        self.physical_write_count
    }

    /// 将 `size` 字节的第 `block` 块转换为物理扇区地址和扇区数
    fn logical_to_physical(&self, block: u64, size: usize) -> Result<(u64, u32)> {
        let sector_size = self.device.sector_size() as u64;
        if size == 0 || size as u64 % sector_size != 0 {
            return Err(Error::new(
                ErrorKind::InvalidBlockSize,
                "Block size must be a multiple of the sector size",
            ));
        }
        let start = block
            .checked_mul(size as u64)
            .filter(|&s| {
                s.checked_add(size as u64)
                    .map_or(false, |end| end <= self.partition_size)
            })
            .ok_or(Error::new(
                ErrorKind::InvalidInput,
                "Block lies beyond the end of the partition",
            ))?;
        let lba = (start + self.partition_offset) / sector_size;
        Ok((lba, (size as u64 / sector_size) as u32))
    }

    /// 读取一个块，块大小为 `buf.len()`
    pub fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<usize> {
        let (lba, count) = self.logical_to_physical(block, buf.len())?;
        self.physical_read_count += 1;
        self.device.read_blocks(lba, count, buf)
    }

    /// 写入一个块，块大小为 `buf.len()`
    pub fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<usize> {
        if self.device.is_read_only() {
            return Err(Error::new(ErrorKind::InvalidInput, "Device is read-only"));
        }
        let (lba, count) = self.logical_to_physical(block, buf.len())?;
        self.physical_write_count += 1;
        self.device.write_blocks(lba, count, buf)
    }

    /// 刷新底层设备
    pub fn flush(&mut self) -> Result<()> {
        self.device.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;

    #[test]
    fn test_block_to_sector_conversion() {
        let mem = MemDevice::new(512, 64);
        let mut bd = BlockDev::new(mem.clone());
        bd.write_block(3, &[0x5A; 1024]).unwrap();
        // 第 3 个 1024 字节块从第 6 个扇区开始
        assert_eq!(mem.read_bytes(6 * 512, 2), vec![0x5A, 0x5A]);
        assert_eq!(bd.physical_write_count(), 1);
    }

    #[test]
    fn test_partition_offset_applied() {
        let mem = MemDevice::new(512, 64);
        let mut bd = BlockDev::new_partition(mem.clone(), 4096, 8192).unwrap();
        bd.write_block(0, &[1; 512]).unwrap();
        assert_eq!(mem.read_bytes(4096, 1), vec![1]);

        let mut buf = [0u8; 4096];
        assert!(bd.read_block(1, &mut buf).is_ok());
        let err = bd.read_block(2, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_bad_partition_rejected() {
        let mem = MemDevice::new(512, 64);
        assert!(BlockDev::new_partition(mem.clone(), 100, 512).is_err());
        assert!(BlockDev::new_partition(mem, 512, 64 * 512).is_err());
    }

    #[test]
    fn test_read_only_device_refuses_writes() {
        let mem = MemDevice::new(512, 8);
        mem.set_read_only(true);
        let mut bd = BlockDev::new(mem);
        assert!(bd.write_block(0, &[0; 512]).is_err());
        assert_eq!(bd.physical_write_count(), 0);
    }
}
