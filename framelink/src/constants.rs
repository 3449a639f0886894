//! 协议常量定义

use std::time::Duration;

/// 报头大小: 2 字节内容码 + 2 字节操作码 + 4 字节长度
pub const HEADER_LEN: usize = 8;

/// 内置操作码: 文件传输端口 `{"port": port}`
pub const FT_TRANSFER_PORT: u16 = 60020;

/// 内置操作码: 多文件传输时的头部信息 `{"file_count": n}`
pub const FT_SEND_FILES_HEADER: u16 = 62000;

/// 单次 recv 请求的最大字节数
pub const RECV_CHUNK_SIZE: usize = 1024;

/// 发送文件时单次读取的块大小
pub const FILE_CHUNK_SIZE: usize = 2048;

/// UDP 接收缓冲区大小（单个数据报上限）
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// 默认的消息帧最大大小 (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 服务端最大连接数
pub const MAX_CONNECTIONS: usize = 100;

/// 服务端每个连接的发送队列长度
pub const SEND_QUEUE_SIZE: usize = 256;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 文件传输握手超时（秒）
pub const TRANSFER_TIMEOUT_SECS: u64 = 15;

/// 服务端关闭时等待连接退出的时间（秒）
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// 默认下载目录
pub const DOWNLOAD_DIR: &str = "download";

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 文件传输握手超时 Duration
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(TRANSFER_TIMEOUT_SECS);

/// 关闭等待 Duration
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(SHUTDOWN_GRACE_SECS);
