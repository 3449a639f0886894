//! 错误类型定义

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 文件传输中断时已完成的进度
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// 单文件传输: 已传输的字节数
    Bytes(u64),
    /// 多文件传输: 已完成的文件
    Files(Vec<PathBuf>),
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Bytes(n) => write!(f, "{} bytes", n),
            Progress::Files(files) => write!(f, "{} files", files.len()),
        }
    }
}

/// 协议错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 期待一帧时读到 0 字节（对端已关闭）
    #[error("Empty frame: peer closed the connection")]
    EmptyFrame,

    /// 报头不完整或无法解析
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// 正文内容与内容码不匹配
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// 文本正文不是合法的 UTF-8
    #[error("Text decode error: {0}")]
    TextDecode(#[from] std::string::FromUtf8Error),

    /// JSON 正文解析失败
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 套接字 IO 错误
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// 连接超时
    #[error("Connection timeout")]
    ConnectTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    Closed,

    /// 发送队列已满，对端读取跟不上
    #[error("Send queue full")]
    Backpressure,

    /// 接收超时（可重试，不会关闭连接）
    #[error("Receive timeout")]
    Timeout,

    /// 收到了非预期的操作码
    #[error("Unexpected opcode: expected {expected}, got {actual}")]
    UnexpectedOpcode { expected: u16, actual: u16 },

    /// 文件名为空、含 NUL 或不是单一路径分量
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    /// 本地文件读写失败
    #[error("File error on {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 文件传输中途失败
    #[error("Transfer incomplete after {completed}: {source}")]
    TransferIncomplete {
        completed: Progress,
        #[source]
        source: std::io::Error,
    },

    /// 握手期间未建立传输连接
    #[error("No transfer connection within {0:?}")]
    TransferTimeout(Duration),
}

impl Error {
    /// 该错误是否意味着所在的控制连接已不可用
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Timeout
                | Error::Backpressure
                | Error::UnexpectedOpcode { .. }
                | Error::InvalidFilename(_)
                | Error::File { .. }
                | Error::TransferIncomplete { .. }
                | Error::TransferTimeout(_)
        )
    }
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_fatal() {
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::TransferTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!Error::Backpressure.is_fatal());
    }

    #[test]
    fn test_framing_errors_are_fatal() {
        assert!(Error::EmptyFrame.is_fatal());
        assert!(Error::MalformedHeader("short".into()).is_fatal());
        assert!(Error::FrameTooLarge { size: 10, max: 1 }.is_fatal());
        assert!(Error::Connection(std::io::ErrorKind::BrokenPipe.into()).is_fatal());
    }

    #[test]
    fn test_progress_display() {
        assert_eq!(Progress::Bytes(12).to_string(), "12 bytes");
        assert_eq!(
            Progress::Files(vec![PathBuf::from("a"), PathBuf::from("b")]).to_string(),
            "2 files"
        );
    }
}
