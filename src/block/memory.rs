//! 内存块设备
//!
//! 用于测试和嵌入场景的 RAM 盘。克隆共享同一份存储，便于在把设备交给
//! 驱动之后继续检查内容、注入故障。

use super::device::BlockDevice;
use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct MemInner {
    storage: Vec<u8>,
    read_only: bool,
    fail_reads: bool,
    fail_writes: bool,
    reads: u64,
    writes: u64,
    flushes: u64,
}

/// 内存块设备
#[derive(Debug, Clone)]
pub struct MemDevice {
    sector_size: u32,
    total_sectors: u64,
    inner: Arc<Mutex<MemInner>>,
}

impl MemDevice {
    /// 创建 `total_sectors` 个 `sector_size` 字节扇区的设备，内容全零
    pub fn new(sector_size: u32, total_sectors: u64) -> Self {
        Self {
            sector_size,
            total_sectors,
            inner: Arc::new(Mutex::new(MemInner {
                storage: vec![0u8; (sector_size as u64 * total_sectors) as usize],
                read_only: false,
                fail_reads: false,
                fail_writes: false,
                reads: 0,
                writes: 0,
                flushes: 0,
            })),
        }
    }

    /// 让后续读取失败
    pub fn fail_reads(&self, on: bool) {
        self.inner.lock().fail_reads = on;
    }

    /// 让后续写入失败
    pub fn fail_writes(&self, on: bool) {
        self.inner.lock().fail_writes = on;
    }

    /// 设置只读
    pub fn set_read_only(&self, on: bool) {
        self.inner.lock().read_only = on;
    }

    /// 成功的读操作次数
    pub fn read_count(&self) -> u64 {
        self.inner.lock().reads
    }

    /// 成功的写操作次数
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }

    /// flush 次数
    pub fn flush_count(&self) -> u64 {
        self.inner.lock().flushes
    }

    /// 绕过设备接口直接读取内容
    pub fn read_bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let start = offset as usize;
        inner.storage[start..start + len].to_vec()
    }

    /// 绕过设备接口直接写入内容
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        let mut inner = self.inner.lock();
        let start = offset as usize;
        inner.storage[start..start + data.len()].copy_from_slice(data);
    }

    fn range(&self, lba: u64, count: u32) -> Result<core::ops::Range<usize>> {
        let end = lba
            .checked_add(count as u64)
            .filter(|&end| end <= self.total_sectors)
            .ok_or(Error::new(ErrorKind::InvalidInput, "Sector range out of bounds"))?;
        let sector = self.sector_size as usize;
        Ok(lba as usize * sector..end as usize * sector)
    }
}

impl BlockDevice for MemDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        let range = self.range(lba, count)?;
        let mut inner = self.inner.lock();
        if inner.fail_reads {
            return Err(Error::new(ErrorKind::Io, "Injected read failure"));
        }
        let len = range.len();
        buf[..len].copy_from_slice(&inner.storage[range]);
        inner.reads += 1;
        Ok(len)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        let range = self.range(lba, count)?;
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(Error::new(ErrorKind::Io, "Injected write failure"));
        }
        let len = range.len();
        inner.storage[range].copy_from_slice(&buf[..len]);
        inner.writes += 1;
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.lock().flushes += 1;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_storage() {
        let dev = MemDevice::new(512, 4);
        let mut other = dev.clone();
        other.write_blocks(1, 1, &[3u8; 512]).unwrap();
        assert_eq!(dev.read_bytes(512, 2), vec![3, 3]);
        assert_eq!(dev.write_count(), 1);
    }

    #[test]
    fn test_fault_injection() {
        let mut dev = MemDevice::new(512, 4);
        let mut buf = [0u8; 512];
        dev.fail_reads(true);
        assert_eq!(dev.read_blocks(0, 1, &mut buf).unwrap_err().kind(), ErrorKind::Io);
        dev.fail_reads(false);
        assert!(dev.read_blocks(0, 1, &mut buf).is_ok());
        assert_eq!(dev.read_count(), 1);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut dev = MemDevice::new(512, 4);
        let mut buf = [0u8; 1024];
        assert!(dev.read_blocks(3, 2, &mut buf).is_err());
    }
}
