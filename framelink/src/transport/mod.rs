//! 传输层抽象
//!
//! [`Link`] 描述一条已建立的点对点链路，可拆分为独立的读取端和写入端，
//! 使接收任务与发送方可以并发工作。客户端角色通过组合选择 TCP 或 UDP 实现。

mod tcp;
mod udp;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::{CONNECT_TIMEOUT, MAX_FRAME_SIZE};

pub use tcp::{TcpLink, TcpListener};
pub use udp::{UdpLink, UdpReader, UdpWriter};
pub(crate) use udp::{check_sent, encode_datagram, is_unreachable};

/// 传输层配置
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 是否禁用 Nagle 算法（TCP nodelay）
    pub nodelay: bool,
    /// 接收超时，`None` 表示一直等待
    pub recv_timeout: Option<Duration>,
    /// 允许的最大正文长度
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true,
            recv_timeout: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// 点对点链路抽象
pub trait Link: Send + Sized + 'static {
    /// 读取端类型
    type Reader: LinkReader;
    /// 写入端类型
    type Writer: LinkWriter;

    /// 建立链路
    ///
    /// # Arguments
    /// * `addr` - 对端地址，格式为 "host:port"
    /// * `config` - 传输配置
    fn connect(
        addr: &str,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<Self>> + Send;

    fn peer_addr(&self) -> SocketAddr;

    /// 分离读写端
    fn split(self) -> (Self::Reader, Self::Writer);

    /// 该错误发生后链路是否已不可用
    fn is_fatal(err: &Error) -> bool {
        err.is_fatal()
    }
}

/// 链路读取端
pub trait LinkReader: Send + 'static {
    /// 接收一条完整消息
    fn recv(&mut self) -> impl Future<Output = Result<Message>> + Send;

    fn set_recv_timeout(&mut self, recv_timeout: Option<Duration>);
}

/// 链路写入端
pub trait LinkWriter: Send + 'static {
    /// 发送一条完整消息
    fn send(&mut self, msg: &Message) -> impl Future<Output = Result<()>> + Send;

    /// 关闭写方向，失败时静默
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}
