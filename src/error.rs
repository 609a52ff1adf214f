//! 错误类型定义
//!
//! 提供块缓冲区缓存操作的错误类型。

use core::fmt;

/// 缓存操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 设备读写失败（`complete_io(success=false)`）
    Io,
    /// 无空闲缓冲区且无法回收（暂时性背压，可重试）
    OutOfBuffers,
    /// 块大小不是受支持的 2 的幂，或超过页大小
    InvalidBlockSize,
    /// 无效参数（配置或可调参数越界）
    InvalidInput,
    /// 无效状态（不变量检查失败等）
    InvalidState,
    /// 设备不存在
    NotFound,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 是否为暂时性错误（背压类，调用者应让出后重试）
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::OutOfBuffers)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::new(ErrorKind::Io, "write failed");
        assert_eq!(err.to_string(), "Io: write failed");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.message(), "write failed");
    }

    #[test]
    fn test_transient() {
        assert!(Error::new(ErrorKind::OutOfBuffers, "").is_transient());
        assert!(!Error::new(ErrorKind::InvalidInput, "").is_transient());
        assert!(!Error::new(ErrorKind::Io, "").is_transient());
    }
}
