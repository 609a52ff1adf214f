//! I/O 请求与完成处理
//!
//! 缓存把每个缓冲区的一次读或写包装成一个 [`IoRequest`] 交给块驱动。
//! 驱动对每个请求恰好调用一次 [`IoRequest::complete`]；请求被丢弃而没有
//! 完成时按失败处理，保证等待者总能被唤醒。
//!
//! 完成时的附加行为由 [`CompletionKind`] 决定，全部在一个中心函数中解释：
//!
//! - `SyncWake`：只唤醒缓冲区上的等待者
//! - `AsyncPageAggregate`：一页上的全部块完成后，最后一个完成者解锁该页
//! - `KioVecAggregate`：向量 I/O 统计传输字节数与第一个错误，全部完成后唤醒调用者

use super::handle::BufferHandle;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockKey, IoDirection};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// 完成行为
#[derive(Debug, Clone)]
pub enum CompletionKind {
    /// 唤醒缓冲区等待者
    SyncWake,
    /// 页聚合读
    AsyncPageAggregate(Arc<PageIo>),
    /// 向量 I/O 聚合
    KioVecAggregate(Arc<KioVec>),
}

#[derive(Debug)]
struct PageIoState {
    remaining: usize,
    failed: bool,
}

/// 一页上的聚合 I/O
///
/// 页上每个块各有一个请求，全部完成后页才解锁；页是否有效取决于
/// 所有块是否都成功。
#[derive(Debug)]
pub struct PageIo {
    state: Mutex<PageIoState>,
    done: Condvar,
}

impl PageIo {
    pub(crate) fn new(blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PageIoState {
                remaining: blocks,
                failed: false,
            }),
            done: Condvar::new(),
        })
    }

    fn complete_one(&self, success: bool) {
        let mut st = self.state.lock();
        st.failed |= !success;
        st.remaining -= 1;
        if st.remaining == 0 {
            log::trace!("[BCACHE] page io done, failed={}", st.failed);
            self.done.notify_all();
        }
    }

    /// 页是否已解锁
    pub fn is_done(&self) -> bool {
        self.state.lock().remaining == 0
    }

    /// 等待整页完成
    pub fn wait(&self) -> Result<()> {
        let mut st = self.state.lock();
        while st.remaining > 0 {
            self.done.wait(&mut st);
        }
        if st.failed {
            Err(Error::new(ErrorKind::Io, "Page read failed"))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct KioVecState {
    remaining: usize,
    transferred: usize,
    error: Option<Error>,
}

/// 向量 I/O 的聚合状态
#[derive(Debug)]
pub struct KioVec {
    state: Mutex<KioVecState>,
    done: Condvar,
}

impl KioVec {
    pub(crate) fn new(requests: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(KioVecState {
                remaining: requests,
                transferred: 0,
                error: None,
            }),
            done: Condvar::new(),
        })
    }

    fn complete_one(&self, bytes: usize, success: bool) {
        let mut st = self.state.lock();
        if success {
            st.transferred += bytes;
        } else if st.error.is_none() {
            st.error = Some(Error::new(ErrorKind::Io, "Vectored transfer failed"));
        }
        st.remaining -= 1;
        if st.remaining == 0 {
            self.done.notify_all();
        }
    }

    /// 等待全部完成，返回传输的字节数或第一个错误
    pub fn wait(&self) -> Result<usize> {
        let mut st = self.state.lock();
        while st.remaining > 0 {
            self.done.wait(&mut st);
        }
        match st.error.clone() {
            Some(e) => Err(e),
            None => Ok(st.transferred),
        }
    }
}

/// 提交给块驱动的单个缓冲区 I/O
///
/// 请求持有缓冲区的一个引用，直到完成。
pub struct IoRequest {
    handle: Option<BufferHandle>,
    direction: IoDirection,
    completion: CompletionKind,
    key: BlockKey,
}

impl core::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoRequest")
            .field("key", &self.key)
            .field("direction", &self.direction)
            .finish()
    }
}

impl IoRequest {
    pub(crate) fn new(handle: BufferHandle, direction: IoDirection, completion: CompletionKind) -> Self {
        let key = handle.key();
        Self {
            handle: Some(handle),
            direction,
            completion,
            key,
        }
    }

    /// 目标块
    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// I/O 方向
    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    /// 读取缓冲区数据（写请求使用）
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.handle.as_ref().map(|h| h.head().with_data(f))
    }

    /// 填充缓冲区数据（读请求使用）
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.handle.as_ref().map(|h| h.head().with_data_mut(f))
    }

    /// 报告完成
    pub fn complete(mut self, success: bool) {
        self.finish(success);
    }

    fn finish(&mut self, success: bool) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.core().end_io(handle.head(), self.direction, success);
        match &self.completion {
            CompletionKind::SyncWake => {}
            CompletionKind::AsyncPageAggregate(page) => page.complete_one(success),
            CompletionKind::KioVecAggregate(kio) => kio.complete_one(self.key.size as usize, success),
        }
    }
}

impl Drop for IoRequest {
    fn drop(&mut self) {
        if self.handle.is_some() {
            log::warn!("[BCACHE] io request for {:?} dropped without completion", self.key);
            self.finish(false);
        }
    }
}
