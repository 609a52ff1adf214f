//! 具名后台线程

use crate::error::{Error, ErrorKind, Result};
use std::thread::{self, JoinHandle};

/// 以给定名字启动一个后台线程
pub fn spawn_named<T, F>(name: &str, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| {
            log::error!("[BCACHE] failed to spawn {}: {}", name, e);
            Error::new(ErrorKind::InvalidState, "Failed to spawn worker thread")
        })
}
