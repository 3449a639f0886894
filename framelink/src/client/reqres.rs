//! 请求/响应客户端
//!
//! 没有后台任务，严格按 "发送、接收" 的顺序在调用方任务上执行。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{dial, send_failure_is_fatal, ClientConfig};
use crate::error::{Error, Result};
use crate::handler::Handlers;
use crate::message::Message;
use crate::transfer::{self, BatchReport, Outgoing, TransferConfig, TransferPort};
use crate::transport::{Link, LinkReader, LinkWriter, TcpLink};
use crate::FT_TRANSFER_PORT;

/// 请求/响应客户端
pub struct ReqResClient<L: Link> {
    reader: L::Reader,
    writer: L::Writer,
    peer_addr: SocketAddr,
    handlers: Handlers<SocketAddr>,
    closed: bool,
    transfer: TransferConfig,
}

impl<L: Link> ReqResClient<L> {
    /// 连接服务端
    ///
    /// `handlers` 中只有连接和断开回调会被使用。
    pub async fn connect(addr: &str, handlers: Handlers<SocketAddr>, config: ClientConfig) -> Result<Self> {
        let link = L::connect(addr, &config.transport).await?;
        let peer_addr = link.peer_addr();
        let (reader, writer) = link.split();
        info!("Connected to {}", peer_addr);
        handlers.notify_connected(&peer_addr);
        Ok(Self {
            reader,
            writer,
            peer_addr,
            handlers,
            closed: false,
            transfer: config.transfer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 只发送，不等待响应
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let result = self.writer.send(msg).await;
        if let Err(e) = &result {
            if send_failure_is_fatal::<L>(e) {
                self.fail(e).await;
            }
        }
        result
    }

    /// 发送请求并等待一条响应
    ///
    /// 超时返回 `Ok(None)` 且不关闭连接，迟到的响应会被下一次请求读到。
    pub async fn request(&mut self, msg: &Message) -> Result<Option<Message>> {
        match self.send(msg).await {
            Ok(()) => {}
            Err(e @ Error::Connection(_)) if !L::is_fatal(&e) => {
                debug!("Request to {} not delivered: {}", self.peer_addr, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        match self.reader.recv().await {
            Ok(reply) => Ok(Some(reply)),
            Err(Error::Timeout) => {
                debug!("Request to {} timed out", self.peer_addr);
                Ok(None)
            }
            Err(e) if !L::is_fatal(&e) => {
                debug!("No response from {}: {}", self.peer_addr, e);
                Ok(None)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// 主动关闭，不触发断开回调
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.writer.shutdown().await;
            debug!("Closed connection to {}", self.peer_addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_recv_timeout(&mut self, recv_timeout: Option<Duration>) {
        self.reader.set_recv_timeout(recv_timeout);
    }

    pub fn set_transfer_timeout(&mut self, timeout: Duration) {
        self.transfer.timeout = timeout;
    }

    /// 因故障关闭，`closed` 保证断开回调只触发一次
    async fn fail(&mut self, reason: &Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        warn!("Disconnected from {}: {}", self.peer_addr, reason);
        self.writer.shutdown().await;
        self.handlers.notify_disconnected(&self.peer_addr);
    }
}

impl ReqResClient<TcpLink> {
    pub async fn send_file(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let port = self.wait_transfer_port().await?;
        let outgoing = Outgoing::open(path.as_ref()).await?;
        let mut stream = dial(self.peer_addr, port, &self.transfer).await?;
        outgoing.write_to(&mut stream).await
    }

    pub async fn recv_file(&mut self) -> Result<PathBuf> {
        let stream = self.open_transfer().await?;
        transfer::recv_file(stream, &self.transfer.download_dir).await
    }

    pub async fn send_files(&mut self, paths: &[PathBuf]) -> Result<BatchReport> {
        let mut stream = self
            .open_transfer()
            .await
            .map_err(transfer::batch_handshake)?;
        transfer::send_files(&mut stream, &transfer::named(paths)).await
    }

    pub async fn recv_files(&mut self) -> Result<BatchReport> {
        let stream = self
            .open_transfer()
            .await
            .map_err(transfer::batch_handshake)?;
        transfer::recv_files(stream, &self.transfer.download_dir).await
    }

    /// 在自己的读取端上等待 `FT_TRANSFER_PORT`
    async fn wait_transfer_port(&mut self) -> Result<u16> {
        if self.closed {
            return Err(Error::Closed);
        }
        let limit = self.transfer.timeout;
        let received = timeout(limit, self.reader.read_frame())
            .await
            .map_err(|_| Error::TransferTimeout(limit))?;
        let msg = match received {
            Ok(msg) => msg,
            Err(e) => {
                if TcpLink::is_fatal(&e) {
                    self.fail(&e).await;
                }
                return Err(e);
            }
        };
        if msg.opcode() != FT_TRANSFER_PORT {
            return Err(Error::UnexpectedOpcode {
                expected: FT_TRANSFER_PORT,
                actual: msg.opcode(),
            });
        }
        let TransferPort { port } = msg.parse()?;
        Ok(port)
    }

    async fn open_transfer(&mut self) -> Result<TcpStream> {
        let port = self.wait_transfer_port().await?;
        dial(self.peer_addr, port, &self.transfer).await
    }
}
