//! UDP 链路实现
//!
//! 每个数据报是一条完整消息，不做分片重组。套接字在 `connect` 时绑定到对端，
//! 因此 ICMP 端口不可达会以 `ConnectionRefused` 的形式出现在下一次收发上。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use super::{Link, LinkReader, LinkWriter, TransportConfig};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::MAX_DATAGRAM_SIZE;

/// UDP 链路
#[derive(Debug)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    recv_timeout: Option<Duration>,
}

impl Link for UdpLink {
    type Reader = UdpReader;
    type Writer = UdpWriter;

    async fn connect(addr: &str, config: &TransportConfig) -> Result<Self> {
        let peer_addr = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("could not resolve {}", addr))
        })?;
        let local = if peer_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            peer_addr,
            recv_timeout: config.recv_timeout,
        })
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        let reader = UdpReader {
            socket: Arc::clone(&self.socket),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
            recv_timeout: self.recv_timeout,
        };
        (reader, UdpWriter { socket: self.socket })
    }

    /// 无连接: 解码失败、超时和端口不可达都只影响单个数据报
    fn is_fatal(err: &Error) -> bool {
        match err {
            Error::Connection(e) => !is_unreachable(e),
            Error::Closed => true,
            _ => false,
        }
    }
}

impl UdpLink {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// UDP 读取端
#[derive(Debug)]
pub struct UdpReader {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
    recv_timeout: Option<Duration>,
}

impl LinkReader for UdpReader {
    async fn recv(&mut self) -> Result<Message> {
        let received = match self.recv_timeout {
            Some(limit) => timeout(limit, self.socket.recv(&mut self.buf))
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.socket.recv(&mut self.buf).await,
        };
        let n = match received {
            Ok(n) => n,
            // 收到了 ICMP 不可达
            Err(e) if is_unreachable(&e) => return Err(Error::EmptyFrame),
            Err(e) => return Err(e.into()),
        };
        Message::from_bytes(&self.buf[..n])
    }

    fn set_recv_timeout(&mut self, recv_timeout: Option<Duration>) {
        self.recv_timeout = recv_timeout;
    }
}

/// UDP 写入端
#[derive(Debug)]
pub struct UdpWriter {
    socket: Arc<UdpSocket>,
}

impl LinkWriter for UdpWriter {
    async fn send(&mut self, msg: &Message) -> Result<()> {
        let datagram = encode_datagram(msg)?;
        let sent = self.socket.send(&datagram).await?;
        check_sent(sent, datagram.len())
    }

    async fn shutdown(&mut self) {}
}

/// 编码为单个数据报
pub(crate) fn encode_datagram(msg: &Message) -> Result<Bytes> {
    let datagram = msg.to_bytes()?;
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(Error::FrameTooLarge {
            size: datagram.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    Ok(datagram)
}

/// 只有整个数据报都交给了系统才算成功
pub(crate) fn check_sent(sent: usize, len: usize) -> Result<()> {
    if sent != len {
        return Err(Error::Connection(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("datagram truncated: {} of {} bytes", sent, len),
        )));
    }
    Ok(())
}

pub(crate) fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_link_roundtrip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let link = UdpLink::connect(&peer_addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();
        assert_eq!(link.peer_addr(), peer_addr);
        let (mut reader, mut writer) = link.split();

        writer.send(&Message::plain_text(3, "ping")).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            Message::from_bytes(&buf[..n]).unwrap(),
            Message::plain_text(3, "ping")
        );

        let reply = Message::plain_text(4, "pong").to_bytes().unwrap();
        peer.send_to(&reply, from).await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Message::plain_text(4, "pong"));
    }

    #[tokio::test]
    async fn test_udp_link_bad_datagram_is_not_fatal() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = UdpLink::connect(
            &peer.local_addr().unwrap().to_string(),
            &TransportConfig::default(),
        )
        .await
        .unwrap();
        let port = link.local_addr().unwrap().port();
        let (mut reader, _writer) = link.split();

        peer.send_to(&[1, 0, 0], ("127.0.0.1", port)).await.unwrap();
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
        assert!(!UdpLink::is_fatal(&err));
    }

    #[tokio::test]
    async fn test_udp_link_no_listener() {
        // 取一个空闲端口后立即释放
        let vacant = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = vacant.local_addr().unwrap();
        drop(vacant);

        let config = TransportConfig {
            recv_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let link = UdpLink::connect(&dead_addr.to_string(), &config).await.unwrap();
        let (mut reader, mut writer) = link.split();
        let _ = writer.send(&Message::header_only(0)).await;

        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, Error::EmptyFrame | Error::Timeout));
        assert!(!UdpLink::is_fatal(&err));
    }
}
