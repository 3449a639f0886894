//! 服务端连接句柄
//!
//! 每个被接受的 TCP 连接对应一个 [`Connection`]，由服务端持有读取端，
//! 写入端交给一个后台写任务。回调中对 `Connection` 的 `send` 只是入队，
//! 不会阻塞事件循环；队列有上限，对端不读取时 `send` 返回 `Error::Backpressure`，
//! 任务中可以改用 `send_async` 等待空位。`close` 只发出关闭信号，
//! 真正的拆除由服务端循环统一完成，因此断开通知只会触发一次。

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::server::ServerConfig;
use crate::transfer::{self, BatchReport, Outgoing, TransferConfig};
use crate::transport::{Link, TcpLink};
use crate::HEADER_LEN;

struct Inner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    close_tx: watch::Sender<bool>,
    max_frame_size: usize,
    transfer: TransferConfig,
}

/// 服务端连接句柄，可廉价克隆并在回调和任务间传递
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// 接管已接受的连接，启动写任务
    pub(crate) fn open(stream: TcpStream, id: u64, config: &ServerConfig) -> Result<(Self, Inbound)> {
        let link = TcpLink::from_stream(stream, &config.transport)?;
        let peer_addr = link.peer_addr();
        let local_addr = link.local_addr()?;
        let (reader, writer) = link.split();

        let (outbound, outbound_rx) = mpsc::channel(config.send_queue_size.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let conn = Self {
            inner: Arc::new(Inner {
                id,
                peer_addr,
                local_addr,
                outbound,
                close_tx,
                max_frame_size: config.transport.max_frame_size,
                transfer: config.transfer.clone(),
            }),
        };

        tokio::spawn(write_loop(writer, outbound_rx, close_rx.clone(), conn.clone()));
        Ok((conn, Inbound { reader, close_rx }))
    }

    /// 连接编号，在一个服务端实例内唯一
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// 发送消息（入队后由写任务按顺序写出）
    ///
    /// 队列已满时立即返回 `Error::Backpressure`，连接保持打开。
    pub fn send(&self, msg: &Message) -> Result<()> {
        let frame = self.encode(msg)?;
        self.inner.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::Backpressure,
            TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// 发送消息，队列已满时等待写任务腾出空位
    pub async fn send_async(&self, msg: &Message) -> Result<()> {
        let frame = self.encode(msg)?;
        let mut close_rx = self.inner.close_tx.subscribe();
        tokio::select! {
            sent = self.inner.outbound.send(frame) => sent.map_err(|_| Error::Closed),
            _ = closed(&mut close_rx) => Err(Error::Closed),
        }
    }

    fn encode(&self, msg: &Message) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let frame = msg.to_bytes()?;
        let size = frame.len() - HEADER_LEN;
        if size > self.inner.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                max: self.inner.max_frame_size,
            });
        }
        Ok(frame)
    }

    /// 请求关闭连接
    ///
    /// 已入队的消息会先被写出；断开回调由服务端循环触发。
    pub fn close(&self) {
        self.inner.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.close_tx.borrow()
    }

    /// 向对端发送一个文件
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let outgoing = Outgoing::open(path.as_ref()).await?;
        let mut stream = self.open_transfer().await?;
        outgoing.write_to(&mut stream).await
    }

    /// 接收对端发送的一个文件，保存到下载目录
    pub async fn recv_file(&self) -> Result<PathBuf> {
        let stream = self.open_transfer().await?;
        transfer::recv_file(stream, &self.inner.transfer.download_dir).await
    }

    /// 向对端发送多个文件，不可读的文件被跳过
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<BatchReport> {
        let mut stream = self
            .open_transfer()
            .await
            .map_err(transfer::batch_handshake)?;
        transfer::send_files(&mut stream, &transfer::named(paths)).await
    }

    /// 接收对端发送的多个文件
    pub async fn recv_files(&self) -> Result<BatchReport> {
        let stream = self
            .open_transfer()
            .await
            .map_err(transfer::batch_handshake)?;
        transfer::recv_files(stream, &self.inner.transfer.download_dir).await
    }

    /// 服务端一侧总是监听方
    async fn open_transfer(&self) -> Result<TcpStream> {
        transfer::accept_transfer(
            self.inner.local_addr.ip(),
            self.inner.transfer.timeout,
            |msg| self.send(msg),
        )
        .await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 连接的读取端，由服务端循环独占
pub(crate) struct Inbound {
    reader: FrameReader<OwnedReadHalf>,
    close_rx: watch::Receiver<bool>,
}

impl Inbound {
    /// 接收下一条消息；连接被关闭时返回 `Error::Closed`
    pub(crate) async fn next(&mut self) -> Result<Message> {
        tokio::select! {
            msg = self.reader.recv() => msg,
            _ = closed(&mut self.close_rx) => Err(Error::Closed),
        }
    }
}

/// 等待关闭信号；发送端已释放时立即返回
pub(crate) async fn closed(close_rx: &mut watch::Receiver<bool>) {
    let _ = close_rx.wait_for(|closed| *closed).await;
}

/// 写任务: 按顺序写出队列中的帧，关闭时先写完已入队的帧再关闭写方向
async fn write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut outbound: mpsc::Receiver<Bytes>,
    mut close_rx: watch::Receiver<bool>,
    conn: Connection,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_encoded(&frame).await {
                    debug!("Write to connection {} failed: {}", conn.id(), e);
                    conn.close();
                    break;
                }
            }
            _ = closed(&mut close_rx) => {
                while let Ok(frame) = outbound.try_recv() {
                    if writer.write_encoded(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of connection {} failed: {}", conn.id(), e);
    }
}
