//! 后台刷新线程、文件系统回调、关闭流程与排队驱动。

mod common;

use bcache_core::{
    BlockDriver, CacheConfig, CacheManager, DeviceId, FlushAction, FsSync, QueuedDriver,
    SyncDriver, TunableParam,
};
use common::{eventually, mem_device, DEV};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingFs {
    superblocks: AtomicUsize,
    inodes: AtomicUsize,
    per_device: AtomicUsize,
}

impl FsSync for RecordingFs {
    fn sync_superblocks(&self, dev: Option<DeviceId>) {
        self.superblocks.fetch_add(1, Ordering::SeqCst);
        if dev.is_some() {
            self.per_device.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sync_inodes(&self, _dev: Option<DeviceId>) {
        self.inodes.fetch_add(1, Ordering::SeqCst);
    }
}

fn flushing_cache(
    pages: usize,
    configure: impl FnOnce(&mut CacheConfig),
) -> (CacheManager, bcache_core::MemDevice, Arc<RecordingFs>) {
    let dev = mem_device();
    let driver = Arc::new(SyncDriver::new());
    driver.register(DEV, dev.clone()).unwrap();
    let mut config = CacheConfig {
        total_memory: pages * 4096,
        ..CacheConfig::default()
    };
    configure(&mut config);
    let fs = Arc::new(RecordingFs::default());
    let cache = CacheManager::with_parts(config, driver, fs.clone(), None).unwrap();
    (cache, dev, fs)
}

#[test]
fn test_periodic_flusher_writes_aged_buffers() {
    let (cache, dev, fs) = flushing_cache(16, |c| {
        c.tunables.flush_interval_ms = 20;
        c.tunables.age_buffer_ms = 10;
    });
    let bh = cache.get_or_create(DEV, 4, 1024).unwrap();
    bh.write(|d| d.fill(0x11));
    bh.mark_dirty(false);

    assert!(eventually(Duration::from_secs(5), || !bh.is_dirty()));
    assert_eq!(dev.read_bytes(4 * 1024, 1), vec![0x11]);
    assert!(eventually(Duration::from_secs(5), || {
        fs.superblocks.load(Ordering::SeqCst) > 0 && fs.inodes.load(Ordering::SeqCst) > 0
    }));
}

#[test]
fn test_young_buffers_left_alone() {
    let (cache, dev, _) = flushing_cache(16, |c| {
        c.tunables.flush_interval_ms = 10;
        c.tunables.age_buffer_ms = 600_000;
    });
    let bh = cache.get_or_create(DEV, 4, 1024).unwrap();
    bh.write(|d| d.fill(0x22));
    bh.mark_dirty(false);

    std::thread::sleep(Duration::from_millis(100));
    assert!(bh.is_dirty());
    assert_eq!(dev.write_count(), 0);
}

#[test]
fn test_interval_change_rearms_periodic_flusher() {
    let (cache, _, _) = flushing_cache(16, |c| {
        c.tunables.flush_interval_ms = 600_000;
        c.tunables.age_buffer_ms = 10;
    });
    let bh = cache.get_or_create(DEV, 1, 1024).unwrap();
    bh.write(|d| d.fill(1));
    bh.mark_dirty(false);
    std::thread::sleep(Duration::from_millis(50));
    assert!(bh.is_dirty());

    cache.set_tunable(TunableParam::FlushInterval, 20).unwrap();
    assert!(eventually(Duration::from_secs(5), || !bh.is_dirty()));
}

#[test]
fn test_pressure_flusher_drains_past_soft_limit() {
    let (cache, dev, _) = flushing_cache(16, |c| {
        c.tunables.dirty_fraction = 10;
        c.tunables.flush_interval_ms = 600_000;
        c.tunables.age_buffer_ms = 600_000;
    });
    // 软阈值 5%：64 KiB 中超过 3276 字节即唤醒压力刷新
    let handles: Vec<_> = (0..4)
        .map(|block| {
            let bh = cache.get_or_create(DEV, block, 1024).unwrap();
            bh.write(|d| d.fill(block as u8 + 1));
            bh
        })
        .collect();
    for bh in &handles[..3] {
        bh.mark_dirty(false);
    }
    assert_eq!(cache.classify(DEV), FlushAction::NoAction);
    handles[3].mark_dirty(false);

    assert!(eventually(Duration::from_secs(5), || cache.stats().dirty_bytes == 0));
    assert!(handles.iter().all(|h| !h.is_dirty()));
    assert_eq!(dev.read_bytes(3 * 1024, 1), vec![4]);
    assert_eq!(cache.classify(DEV), FlushAction::NoAction);
}

#[test]
fn test_writer_flushes_synchronously_past_hard_limit() {
    let (cache, _, _) = flushing_cache(4, |c| {
        c.spawn_flushers = false;
        c.tunables.dirty_fraction = 20;
    });
    // 16 KiB 的 20% 是 3276 字节，第四个脏缓冲区越过硬阈值
    for block in 0..4 {
        let bh = cache.get_or_create(DEV, block, 1024).unwrap();
        bh.write(|d| d.fill(9));
        bh.mark_dirty(false);
    }
    let stats = cache.stats();
    assert_eq!(stats.sync_flushes, 1);
    assert_eq!(stats.dirty_bytes, 0);
}

#[test]
fn test_shutdown_flushes_and_is_idempotent() {
    let (cache, dev, fs) = flushing_cache(16, |c| {
        c.tunables.flush_interval_ms = 600_000;
        c.tunables.age_buffer_ms = 600_000;
    });
    let bh = cache.get_or_create(DEV, 7, 2048).unwrap();
    bh.write(|d| d.fill(0x77));
    bh.mark_dirty(false);
    drop(bh);

    cache.shutdown();
    assert_eq!(dev.read_bytes(7 * 2048, 2), vec![0x77, 0x77]);
    assert!(fs.superblocks.load(Ordering::SeqCst) >= 1);
    cache.shutdown();

    // 关闭后同步操作照常可用
    let bh = cache.read_through(DEV, 7, 2048).unwrap();
    bh.write(|d| d.fill(0x78));
    bh.mark_dirty(false);
    cache.sync_device(DEV, true).unwrap();
    assert_eq!(dev.read_bytes(7 * 2048, 1), vec![0x78]);
}

#[test]
fn test_fsync_device_runs_hooks_for_device() {
    let (cache, dev, fs) = flushing_cache(16, |c| c.spawn_flushers = false);
    let bh = cache.get_or_create(DEV, 2, 1024).unwrap();
    bh.write(|d| d.fill(5));
    bh.mark_dirty(true);

    cache.fsync_device(DEV).unwrap();
    assert!(!bh.is_dirty());
    assert_eq!(fs.per_device.load(Ordering::SeqCst), 1);
    assert_eq!(fs.inodes.load(Ordering::SeqCst), 1);
    assert_eq!(dev.read_bytes(2 * 1024, 1), vec![5]);

    cache.sync_all().unwrap();
    assert_eq!(fs.superblocks.load(Ordering::SeqCst), 2);
}

#[test]
fn test_queued_driver_completes_off_thread() {
    let dev = mem_device();
    dev.write_bytes(8 * 1024, b"queued");
    let sync = Arc::new(SyncDriver::new());
    sync.register(DEV, dev.clone()).unwrap();
    let queued = Arc::new(QueuedDriver::new(sync).unwrap());
    assert_eq!(queued.device_block_size(DEV), Some(512));

    let config = CacheConfig {
        total_memory: 16 * 4096,
        spawn_flushers: false,
        ..CacheConfig::default()
    };
    let cache = CacheManager::new(config, queued.clone()).unwrap();

    let bh = cache.read_through(DEV, 8, 1024).unwrap();
    assert_eq!(bh.read(|d| d[..6].to_vec()), b"queued");

    let blocks = cache.read_vectored(DEV, &[20, 21, 22], 1024).unwrap();
    for h in &blocks {
        h.write(|d| d.fill(h.block() as u8));
        h.mark_dirty(false);
    }
    cache.sync_device(DEV, true).unwrap();
    assert_eq!(dev.read_bytes(21 * 1024, 1), vec![21]);
    assert_eq!(queued.pending(), 0);

    let page = cache.read_page(DEV, 5, 1024).unwrap();
    assert_eq!(page.len(), 4);
    assert!(page.iter().all(|h| h.is_uptodate()));
}
