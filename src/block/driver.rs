//! 块驱动
//!
//! [`BlockDriver`] 是缓存与设备层之间的接口：缓存提交一批
//! [`IoRequest`]，驱动对每个请求恰好完成一次。
//!
//! - [`SyncDriver`]：在提交者的线程里直接完成 I/O
//! - [`QueuedDriver`]：把请求排队，由后台工作线程完成

use super::device::{BlockDev, BlockDevice};
use crate::cache::IoRequest;
use crate::error::{Error, ErrorKind, Result};
use crate::task::spawn_named;
use crate::types::{DeviceId, IoDirection};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 块驱动接口
pub trait BlockDriver: Send + Sync {
    /// 提交一批请求
    ///
    /// 可以同步完成，也可以稍后在其他线程完成；每个请求都必须调用且只调用
    /// 一次 [`IoRequest::complete`]。
    fn submit_block_io(&self, direction: IoDirection, requests: Vec<IoRequest>);

    /// 设备的最小块大小（硬件扇区大小），未知设备返回 `None`
    fn device_block_size(&self, dev: DeviceId) -> Option<u32>;

    /// 刷新设备的写缓存
    fn flush_device(&self, dev: DeviceId) -> Result<()> {
        let _ = dev;
        Ok(())
    }
}

type SharedDev = Arc<Mutex<BlockDev<Box<dyn BlockDevice>>>>;

/// 同步驱动
///
/// 管理一组已注册的设备，在 `submit_block_io` 内完成全部请求。
#[derive(Default)]
pub struct SyncDriver {
    devices: RwLock<BTreeMap<DeviceId, SharedDev>>,
}

impl SyncDriver {
    /// 创建空驱动
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册整个设备
    pub fn register<D: BlockDevice + 'static>(&self, dev: DeviceId, device: D) -> Result<()> {
        let boxed: Box<dyn BlockDevice> = Box::new(device);
        self.insert(dev, BlockDev::new(boxed))
    }

    /// 注册设备上的一个分区
    pub fn register_partition<D: BlockDevice + 'static>(
        &self,
        dev: DeviceId,
        device: D,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let boxed: Box<dyn BlockDevice> = Box::new(device);
        self.insert(dev, BlockDev::new_partition(boxed, offset, size)?)
    }

    fn insert(&self, dev: DeviceId, bd: BlockDev<Box<dyn BlockDevice>>) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&dev) {
            return Err(Error::new(ErrorKind::InvalidInput, "Device already registered"));
        }
        log::info!(
            "[DRIVER] registered {} ({} bytes at offset {})",
            dev,
            bd.partition_size(),
            bd.partition_offset()
        );
        devices.insert(dev, Arc::new(Mutex::new(bd)));
        Ok(())
    }

    /// 注销设备，返回设备是否存在
    pub fn unregister(&self, dev: DeviceId) -> bool {
        self.devices.write().remove(&dev).is_some()
    }

    /// 设备的物理读写次数 `(reads, writes)`
    pub fn io_counts(&self, dev: DeviceId) -> Option<(u64, u64)> {
        let device = self.device(dev)?;
        let bd = device.lock();
        Some((bd.physical_read_count(), bd.physical_write_count()))
    }

    fn device(&self, dev: DeviceId) -> Option<SharedDev> {
        self.devices.read().get(&dev).cloned()
    }

    /// 执行一个请求，返回是否成功
    fn transfer(&self, direction: IoDirection, request: &IoRequest) -> bool {
        let key = request.key();
        let Some(device) = self.device(key.dev) else {
            log::error!("[DRIVER] {:?} for unknown device {}", direction, key.dev);
            return false;
        };
        let mut bd = device.lock();
        let result = match direction {
            IoDirection::Read => request.with_data_mut(|buf| bd.read_block(key.block, buf)),
            IoDirection::Write => request.with_data(|buf| bd.write_block(key.block, buf)),
        };
        match result {
            Some(Ok(n)) if n == key.size as usize => true,
            Some(Ok(n)) => {
                log::warn!("[DRIVER] short {:?} of {:?}: {} bytes", direction, key, n);
                false
            }
            Some(Err(e)) => {
                log::warn!("[DRIVER] {:?} of {:?} failed: {}", direction, key, e);
                false
            }
            None => false,
        }
    }
}

impl BlockDriver for SyncDriver {
    fn submit_block_io(&self, direction: IoDirection, requests: Vec<IoRequest>) {
        for request in requests {
            let ok = self.transfer(direction, &request);
            request.complete(ok);
        }
    }

    fn device_block_size(&self, dev: DeviceId) -> Option<u32> {
        self.device(dev).map(|d| d.lock().sector_size())
    }

    fn flush_device(&self, dev: DeviceId) -> Result<()> {
        match self.device(dev) {
            Some(device) => device.lock().flush(),
            None => Err(Error::new(ErrorKind::NotFound, "Device not registered")),
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(IoDirection, IoRequest)>,
    stop: bool,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// 排队驱动
///
/// 提交立即返回，请求由名为 `bcache-io` 的工作线程交给内层驱动完成。
/// drop 时处理完剩余请求再退出。
pub struct QueuedDriver {
    inner: Arc<dyn BlockDriver>,
    queue: Arc<Queue>,
    worker: Option<JoinHandle<()>>,
}

impl QueuedDriver {
    /// 包装内层驱动
    pub fn new(inner: Arc<dyn BlockDriver>) -> Result<Self> {
        let queue = Arc::new(Queue::default());
        let worker = {
            let inner = inner.clone();
            let queue = queue.clone();
            spawn_named("bcache-io", move || Self::run(&*inner, &queue))?
        };
        Ok(Self {
            inner,
            queue,
            worker: Some(worker),
        })
    }

    fn run(inner: &dyn BlockDriver, queue: &Queue) {
        loop {
            let (direction, request) = {
                let mut st = queue.state.lock();
                loop {
                    if let Some(item) = st.pending.pop_front() {
                        break item;
                    }
                    if st.stop {
                        return;
                    }
                    queue.ready.wait(&mut st);
                }
            };
            inner.submit_block_io(direction, vec![request]);
        }
    }

    /// 尚未处理的请求数
    pub fn pending(&self) -> usize {
        self.queue.state.lock().pending.len()
    }
}

impl BlockDriver for QueuedDriver {
    fn submit_block_io(&self, direction: IoDirection, requests: Vec<IoRequest>) {
        let mut st = self.queue.state.lock();
        st.pending.extend(requests.into_iter().map(|r| (direction, r)));
        self.queue.ready.notify_one();
    }

    fn device_block_size(&self, dev: DeviceId) -> Option<u32> {
        self.inner.device_block_size(dev)
    }

    fn flush_device(&self, dev: DeviceId) -> Result<()> {
        self.inner.flush_device(dev)
    }
}

impl Drop for QueuedDriver {
    fn drop(&mut self) {
        self.queue.state.lock().stop = true;
        self.queue.ready.notify_all();
        let Some(worker) = self.worker.take() else {
            return;
        };
        // 最后一个引用可能在工作线程里释放
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            log::error!("[DRIVER] io worker panicked");
        }
    }
}
