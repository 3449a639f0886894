//! UDP 服务端
//!
//! 单任务接收循环，每个数据报同步分发给回调。服务端不保存对端状态，
//! 也不会触发连接/断开回调。

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::Server;
use crate::connection::closed;
use crate::error::{Error, Result};
use crate::handler::Handlers;
use crate::message::Message;
use crate::transport::{check_sent, encode_datagram, is_unreachable};
use crate::MAX_DATAGRAM_SIZE;

/// 数据报的发送方
#[derive(Clone)]
pub struct UdpPeer {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

impl UdpPeer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 在回调中直接回复（不等待套接字可写）
    pub fn reply(&self, msg: &Message) -> Result<()> {
        let datagram = encode_datagram(msg)?;
        let sent = self.socket.try_send_to(&datagram, self.addr)?;
        check_sent(sent, datagram.len())
    }

    pub async fn send(&self, msg: &Message) -> Result<()> {
        let datagram = encode_datagram(msg)?;
        let sent = self.socket.send_to(&datagram, self.addr).await?;
        check_sent(sent, datagram.len())
    }
}

impl fmt::Debug for UdpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpPeer").field("addr", &self.addr).finish()
    }
}

/// UDP 服务端
pub struct UdpServer {
    handlers: Handlers<UdpPeer>,
    shutdown_tx: watch::Sender<bool>,
    socket: OnceLock<Arc<UdpSocket>>,
}

impl UdpServer {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handlers: Handlers::new(),
            shutdown_tx,
            socket: OnceLock::new(),
        }
    }

    /// 本地绑定地址，运行前为 `None`
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.get().and_then(|socket| socket.local_addr().ok())
    }

    /// 向任意地址发送一条消息
    pub async fn send_to(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        let socket = self.socket.get().ok_or(Error::Closed)?;
        let datagram = encode_datagram(msg)?;
        let sent = socket.send_to(&datagram, addr).await?;
        check_sent(sent, datagram.len())
    }

    /// 在已绑定的套接字上运行接收循环
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        if self.socket.set(Arc::clone(&socket)).is_err() {
            return Err(Error::Connection(io::Error::new(
                io::ErrorKind::AddrInUse,
                "UDP server is already running",
            )));
        }
        info!("UDP server listening on {}", socket.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (n, addr) = match received {
                        Ok(received) => received,
                        // 之前发出的数据报对端不可达
                        Err(e) if is_unreachable(&e) => {
                            debug!("Ignoring ICMP error: {}", e);
                            continue;
                        }
                        Err(e) => {
                            error!("UDP receive failed: {}", e);
                            return Err(e.into());
                        }
                    };
                    match Message::from_bytes(&buf[..n]) {
                        Ok(msg) => {
                            debug!("Datagram from {}: {}", addr, msg);
                            let peer = UdpPeer {
                                socket: Arc::clone(&socket),
                                addr,
                            };
                            self.handlers.dispatch(&peer, &msg);
                        }
                        Err(e) => warn!("Dropping bad datagram from {}: {}", addr, e),
                    }
                }

                _ = closed(&mut shutdown_rx) => break,
            }
        }
        info!("UDP server stopped");
        Ok(())
    }
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Server for UdpServer {
    type Context = UdpPeer;

    fn handlers_mut(&mut self) -> &mut Handlers<UdpPeer> {
        &mut self.handlers
    }

    async fn start(self: Arc<Self>, addr: &str) -> Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        self.serve(socket).await
    }

    fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, UdpReqResClient};
    use crate::transport::TransportConfig;
    use std::time::Duration;

    async fn spawn(server: UdpServer) -> (Arc<UdpServer>, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let server = Arc::new(server);
        tokio::spawn(server.clone().serve(socket));
        (server, addr)
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            transport: TransportConfig {
                recv_timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reply_to_sender() {
        let mut server = UdpServer::new();
        server.set_message_handler(|peer, msg| {
            let reply = format!("{} bytes from client", msg.payload().len());
            let _ = peer.reply(&Message::plain_text(msg.opcode() + 1, reply));
        });
        let (server, addr) = spawn(server).await;

        let mut client = UdpReqResClient::connect(&addr, Handlers::new(), client_config())
            .await
            .unwrap();
        let reply = client
            .request(&Message::plain_text(10, "abcd"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::plain_text(11, "4 bytes from client"));
        server.stop();
    }

    #[tokio::test]
    async fn test_bad_datagram_is_skipped() {
        let mut server = UdpServer::new();
        server.set_message_handler(|peer, msg| {
            let _ = peer.reply(msg);
        });
        let (server, addr) = spawn(server).await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[9, 9, 9], addr.as_str()).await.unwrap();

        let mut client = UdpReqResClient::connect(&addr, Handlers::new(), client_config())
            .await
            .unwrap();
        let reply = client.request(&Message::header_only(4)).await.unwrap();
        assert_eq!(reply, Some(Message::header_only(4)));
        server.stop();
    }

    #[tokio::test]
    async fn test_send_to_address() {
        let (server, _addr) = spawn(UdpServer::new()).await;
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        while server.local_addr().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server
            .send_to(&Message::plain_text(2, "push"), target.local_addr().unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, _) = target.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            Message::from_bytes(&buf[..n]).unwrap(),
            Message::plain_text(2, "push")
        );
        server.stop();
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let server = UdpServer::new();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            server.send_to(&Message::header_only(0), target).await,
            Err(Error::Closed)
        ));
    }
}
