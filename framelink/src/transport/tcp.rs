//! TCP 链路实现

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{Link, LinkReader, LinkWriter, TransportConfig};
use crate::codec::{FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::message::Message;

/// TCP 链路
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: TransportConfig,
}

impl Link for TcpLink {
    type Reader = FrameReader<OwnedReadHalf>;
    type Writer = FrameWriter<OwnedWriteHalf>;

    async fn connect(addr: &str, config: &TransportConfig) -> Result<Self> {
        // 带超时的连接
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        Self::from_stream(stream, config)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = self.stream.into_split();
        let mut reader =
            FrameReader::new(reader).with_max_frame_size(self.config.max_frame_size);
        reader.set_recv_timeout(self.config.recv_timeout);
        let writer = FrameWriter::new(writer).with_max_frame_size(self.config.max_frame_size);
        (reader, writer)
    }
}

impl TcpLink {
    /// 从已有的 TcpStream 创建（服务端 accept 后使用）
    pub fn from_stream(stream: TcpStream, config: &TransportConfig) -> Result<Self> {
        stream.set_nodelay(config.nodelay)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer_addr,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> LinkReader for FrameReader<R> {
    async fn recv(&mut self) -> Result<Message> {
        FrameReader::recv(self).await
    }

    fn set_recv_timeout(&mut self, recv_timeout: Option<Duration>) {
        FrameReader::set_recv_timeout(self, recv_timeout);
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> LinkWriter for FrameWriter<W> {
    async fn send(&mut self, msg: &Message) -> Result<()> {
        self.write_frame(msg).await
    }

    async fn shutdown(&mut self) {
        if let Err(e) = FrameWriter::shutdown(self).await {
            debug!("Shutdown of write half failed: {}", e);
        }
    }
}

/// TCP 监听器
#[derive(Debug)]
pub struct TcpListener {
    listener: tokio::net::TcpListener,
}

impl TcpListener {
    /// 绑定地址并开始监听
    ///
    /// # Arguments
    /// * `addr` - 监听地址，格式为 "host:port"
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// 接受新连接
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.listener.accept().await?)
    }

    /// 获取本地绑定地址
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_tcp_listener_bind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_tcp_link_send_recv() {
        // 启动监听
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 客户端连接
        let client_handle = tokio::spawn(async move {
            let config = TransportConfig::default();
            let link = TcpLink::connect(&addr.to_string(), &config).await.unwrap();
            assert_eq!(link.peer_addr(), addr);
            let (mut reader, mut writer) = link.split();

            let msg = Message::json(0, json!({"text": "hi"}).as_object().unwrap().clone());
            LinkWriter::send(&mut writer, &msg).await.unwrap();
            LinkReader::recv(&mut reader).await.unwrap()
        });

        // 服务端接受
        let (stream, _) = listener.accept().await.unwrap();
        let link = TcpLink::from_stream(stream, &TransportConfig::default()).unwrap();
        let (mut reader, mut writer) = link.split();
        let msg = LinkReader::recv(&mut reader).await.unwrap();
        assert_eq!(msg.get("text").unwrap(), Some(&json!("hi")));
        LinkWriter::send(&mut writer, &Message::plain_text(1, "pong"))
            .await
            .unwrap();

        let reply = client_handle.await.unwrap();
        assert_eq!(reply, Message::plain_text(1, "pong"));
    }

    #[tokio::test]
    async fn test_tcp_link_recv_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = TransportConfig {
            recv_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let link = TcpLink::connect(&addr.to_string(), &config).await.unwrap();
        let (_server_stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = link.split();

        assert!(matches!(
            LinkReader::recv(&mut reader).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_tcp_link_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let link = TcpLink::connect(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        drop(server_stream);

        let (mut reader, _writer) = link.split();
        assert!(matches!(
            LinkReader::recv(&mut reader).await,
            Err(Error::EmptyFrame)
        ));
    }
}
