//! 集成测试共用的设备、驱动与缓存构造

#![allow(dead_code)]

use bcache_core::{
    BlockDriver, CacheConfig, CacheManager, DeviceId, IoDirection, IoRequest, MemDevice,
    SyncDriver,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEV: DeviceId = DeviceId(1);

/// 512 字节扇区，共 4 MiB
pub fn mem_device() -> MemDevice {
    MemDevice::new(512, 8192)
}

pub fn config(pages: usize) -> CacheConfig {
    CacheConfig {
        total_memory: pages * 4096,
        spawn_flushers: false,
        ..CacheConfig::default()
    }
}

/// 同步驱动上的缓存，注册一个 RAM 盘为 [`DEV`]
pub fn sync_cache(pages: usize) -> (CacheManager, MemDevice) {
    let dev = mem_device();
    let driver = Arc::new(SyncDriver::new());
    driver.register(DEV, dev.clone()).expect("register");
    let cache = CacheManager::new(config(pages), driver).expect("cache");
    (cache, dev)
}

/// [`ManualDriver`] 上的缓存；内存足够大，标脏少量缓冲区不会触发同步刷新
pub fn manual_cache() -> (CacheManager, Arc<ManualDriver>, MemDevice) {
    let dev = mem_device();
    let driver = Arc::new(ManualDriver::new());
    driver.inner.register(DEV, dev.clone()).expect("register");
    let cache = CacheManager::new(config(256), driver.clone()).expect("cache");
    (cache, driver, dev)
}

/// 扣住所有提交的请求，直到测试手动完成
pub struct ManualDriver {
    pub inner: SyncDriver,
    pending: Mutex<Vec<(IoDirection, IoRequest)>>,
    arrived: Condvar,
}

impl ManualDriver {
    pub fn new() -> Self {
        Self {
            inner: SyncDriver::new(),
            pending: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// 等待至少 `n` 个请求到达
    pub fn wait_pending(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while pending.len() < n {
            if self.arrived.wait_until(&mut pending, deadline).timed_out() {
                return pending.len() >= n;
            }
        }
        true
    }

    /// 把扣住的请求交给已注册的设备执行
    pub fn release_all(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let n = batch.len();
        for (direction, request) in batch {
            self.inner.submit_block_io(direction, vec![request]);
        }
        n
    }

    /// 不访问设备，把扣住的请求全部按失败完成
    pub fn fail_all(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let n = batch.len();
        for (_, request) in batch {
            request.complete(false);
        }
        n
    }
}

impl BlockDriver for ManualDriver {
    fn submit_block_io(&self, direction: IoDirection, requests: Vec<IoRequest>) {
        let mut pending = self.pending.lock();
        pending.extend(requests.into_iter().map(|r| (direction, r)));
        self.arrived.notify_all();
    }

    fn device_block_size(&self, dev: DeviceId) -> Option<u32> {
        self.inner.device_block_size(dev)
    }

    fn flush_device(&self, dev: DeviceId) -> bcache_core::Result<()> {
        self.inner.flush_device(dev)
    }
}

/// 轮询 `cond` 直到成立或超时
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
