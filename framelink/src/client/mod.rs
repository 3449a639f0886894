//! 客户端角色
//!
//! 两种角色都通过组合选择传输层: `ChannelClient<TcpLink>`、`ReqResClient<UdpLink>` 等。
//! 文件传输只在 TCP 链路上提供，客户端总是握手中的连接方。

mod channel;
mod reqres;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::transfer::{self, TransferConfig};
use crate::transport::{Link, TcpLink, TransportConfig, UdpLink};

pub use channel::ChannelClient;
pub use reqres::ReqResClient;

pub type TcpChannelClient = ChannelClient<TcpLink>;
pub type TcpReqResClient = ReqResClient<TcpLink>;
pub type UdpChannelClient = ChannelClient<UdpLink>;
pub type UdpReqResClient = ReqResClient<UdpLink>;

/// 客户端配置
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
}

impl ClientConfig {
    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Self {
        self.transport.recv_timeout = Some(recv_timeout);
        self
    }
}

/// 发送失败后链路是否已不可用
///
/// 编码和大小检查在写入前完成，这类失败不影响连接。
fn send_failure_is_fatal<L: Link>(err: &Error) -> bool {
    matches!(err, Error::Connection(_) | Error::Closed) && L::is_fatal(err)
}

/// 连接对端宣布的传输端口
async fn dial(peer: SocketAddr, port: u16, config: &TransferConfig) -> Result<TcpStream> {
    transfer::dial_transfer(peer.ip(), port, config.timeout).await
}
