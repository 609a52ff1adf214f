//! 后台刷新线程
//!
//! 两个长期运行的线程由 [`CacheManager`](crate::CacheManager) 在初始化时
//! 启动、在关闭时等待退出：
//!
//! - 周期刷新：每隔 `flush_interval` 醒来，提交期限已到的脏缓冲区，
//!   然后请求文件系统同步元数据
//! - 压力刷新：由写入者在脏数据比例越过软阈值时唤醒，按变脏的先后
//!   写回脏缓冲区，直到比例回落或无可写回的缓冲区
//!
//! 两者通过同一个 [`FlushSignal`] 接收唤醒、重新配置与停止信号。

use super::FlushAction;
use crate::cache::manager::CacheCore;
use crate::error::Result;
use crate::task::spawn_named;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SignalState {
    pressure: bool,
    stop: bool,
    reconfigured: bool,
}

/// 周期线程醒来的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Tick,
    Reconfigured,
    Stop,
}

/// 刷新线程的唤醒信号
#[derive(Debug, Default)]
pub(crate) struct FlushSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl FlushSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 唤醒压力刷新线程
    pub(crate) fn wake_pressure(&self) {
        let mut st = self.state.lock();
        if !st.pressure {
            st.pressure = true;
            self.cv.notify_all();
        }
    }

    /// 刷新间隔已修改
    pub(crate) fn reconfigure(&self) {
        self.state.lock().reconfigured = true;
        self.cv.notify_all();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stop = true;
        self.cv.notify_all();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.state.lock().stop
    }

    /// 等待压力唤醒；收到停止信号时返回 `false`
    pub(crate) fn wait_pressure(&self) -> bool {
        let mut st = self.state.lock();
        loop {
            if st.stop {
                return false;
            }
            if st.pressure {
                st.pressure = false;
                return true;
            }
            self.cv.wait(&mut st);
        }
    }

    /// 睡眠 `interval`，可被停止或重新配置打断
    pub(crate) fn wait_tick(&self, interval: Duration) -> Wake {
        let deadline = Instant::now() + interval;
        let mut st = self.state.lock();
        loop {
            if st.stop {
                return Wake::Stop;
            }
            if st.reconfigured {
                st.reconfigured = false;
                return Wake::Reconfigured;
            }
            if self.cv.wait_until(&mut st, deadline).timed_out() {
                return if st.stop { Wake::Stop } else { Wake::Tick };
            }
        }
    }
}

/// 两个刷新线程的句柄
pub(crate) struct Flushers {
    core: Arc<CacheCore>,
    periodic: JoinHandle<()>,
    pressure: JoinHandle<()>,
}

impl Flushers {
    pub(crate) fn spawn(core: &Arc<CacheCore>) -> Result<Self> {
        let periodic = {
            let core = core.clone();
            spawn_named("bcache-periodic", move || periodic_loop(&core))?
        };
        let pressure = {
            let core = core.clone();
            spawn_named("bcache-pressure", move || pressure_loop(&core))
        };
        let pressure = match pressure {
            Ok(handle) => handle,
            Err(e) => {
                core.signal.stop();
                let _ = periodic.join();
                return Err(e);
            }
        };
        Ok(Self {
            core: core.clone(),
            periodic,
            pressure,
        })
    }

    /// 发出停止信号并等待两个线程退出
    pub(crate) fn stop(self) {
        self.core.signal.stop();
        for (name, handle) in [("periodic", self.periodic), ("pressure", self.pressure)] {
            if handle.join().is_err() {
                log::error!("[FLUSH] {} flusher panicked", name);
            }
        }
        log::info!("[FLUSH] flushers stopped");
    }
}

fn periodic_loop(core: &Arc<CacheCore>) {
    log::info!("[FLUSH] periodic flusher started");
    loop {
        let interval = core.flush.tunables().flush_interval();
        match core.signal.wait_tick(interval) {
            Wake::Stop => break,
            Wake::Reconfigured => {
                log::debug!("[FLUSH] flush interval changed");
                continue;
            }
            Wake::Tick => {}
        }

        let submitted = core.flush_expired(Instant::now());
        if submitted > 0 {
            log::debug!("[FLUSH] periodic pass submitted {} buffers", submitted);
        }
        core.fs.sync_superblocks(None);
        core.fs.sync_inodes(None);
    }
}

fn pressure_loop(core: &Arc<CacheCore>) {
    log::info!("[FLUSH] pressure flusher started");
    while core.signal.wait_pressure() {
        let mut written = 0;
        while core.flush.classify_global() != FlushAction::NoAction && !core.signal.is_stopping() {
            let max = core.flush.tunables().max_buffers_per_pass as usize;
            match core.flush_dirty(max) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) => {
                    log::warn!("[FLUSH] pressure pass failed: {}", e);
                    break;
                }
            }
        }
        log::debug!(
            "[FLUSH] pressure flush wrote {} buffers, dirty ratio {:.3}",
            written,
            core.flush.dirty_ratio()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pressure_wake_is_consumed() {
        let signal = Arc::new(FlushSignal::new());
        signal.wake_pressure();
        assert!(signal.wait_pressure());

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_pressure())
        };
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_tick_interrupted_by_reconfigure_and_stop() {
        let signal = Arc::new(FlushSignal::new());
        assert_eq!(signal.wait_tick(Duration::from_millis(10)), Wake::Tick);

        signal.reconfigure();
        assert_eq!(signal.wait_tick(Duration::from_secs(60)), Wake::Reconfigured);

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_tick(Duration::from_secs(60)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert_eq!(waiter.join().unwrap(), Wake::Stop);
    }
}
