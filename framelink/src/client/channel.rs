//! 异步通道客户端
//!
//! 后台接收任务持续读取并分发消息，调用方可以同时发送。`FT_TRANSFER_PORT`
//! 由接收任务截获，交给等待中的文件传输，不会到达用户回调。
//! 发送路径和接收任务谁先发现连接故障都只触发一次断开回调。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::{dial, send_failure_is_fatal, ClientConfig};
use crate::connection::closed;
use crate::error::{Error, Result};
use crate::handler::Handlers;
use crate::message::Message;
use crate::transfer::{self, BatchReport, Outgoing, PortRendezvous, TransferConfig, TransferPort};
use crate::transport::{Link, LinkReader, LinkWriter, TcpLink};
use crate::FT_TRANSFER_PORT;

/// 发送路径与接收任务共享的状态
struct Shared<W> {
    peer_addr: SocketAddr,
    writer: Mutex<W>,
    closed: watch::Sender<bool>,
    /// 断开回调是否已触发（或已被 `close` 抑制）
    notified: AtomicBool,
    handlers: Handlers<SocketAddr>,
    rendezvous: PortRendezvous,
}

impl<W: LinkWriter> Shared<W> {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// 因故障进入关闭状态
    async fn disconnect(&self, reason: &Error) {
        self.closed.send_replace(true);
        self.rendezvous.close().await;
        if !self.notified.swap(true, Ordering::SeqCst) {
            warn!("Disconnected from {}: {}", self.peer_addr, reason);
            self.handlers.notify_disconnected(&self.peer_addr);
        }
        self.writer.lock().await.shutdown().await;
    }
}

/// 异步通道客户端
pub struct ChannelClient<L: Link> {
    shared: Arc<Shared<L::Writer>>,
    recv_timeout: watch::Sender<Option<Duration>>,
    transfer: TransferConfig,
}

impl<L: Link> ChannelClient<L> {
    /// 连接服务端并启动接收任务
    pub async fn connect(addr: &str, handlers: Handlers<SocketAddr>, config: ClientConfig) -> Result<Self> {
        let link = L::connect(addr, &config.transport).await?;
        let peer_addr = link.peer_addr();
        let (reader, writer) = link.split();

        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            peer_addr,
            writer: Mutex::new(writer),
            closed,
            notified: AtomicBool::new(false),
            handlers,
            rendezvous: PortRendezvous::default(),
        });
        let (recv_timeout, timeout_rx) = watch::channel(config.transport.recv_timeout);

        info!("Connected to {}", peer_addr);
        shared.handlers.notify_connected(&peer_addr);
        tokio::spawn(receive_loop::<L>(Arc::clone(&shared), reader, timeout_rx));

        Ok(Self {
            shared,
            recv_timeout,
            transfer: config.transfer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// 发送一条消息，可与接收任务并发
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let result = self.shared.writer.lock().await.send(msg).await;
        if let Err(e) = &result {
            if send_failure_is_fatal::<L>(e) {
                self.shared.disconnect(e).await;
            }
        }
        result
    }

    /// 主动关闭，不触发断开回调
    pub async fn close(&self) {
        self.shared.notified.store(true, Ordering::SeqCst);
        self.shared.closed.send_replace(true);
        self.shared.rendezvous.close().await;
        self.shared.writer.lock().await.shutdown().await;
        debug!("Closed connection to {}", self.shared.peer_addr);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// 设置接收超时；接收任务超时后继续等待，不会断开
    pub fn set_recv_timeout(&self, recv_timeout: Option<Duration>) {
        self.recv_timeout.send_replace(recv_timeout);
    }

    /// 设置文件传输握手的等待时间
    pub fn set_transfer_timeout(&mut self, timeout: Duration) {
        self.transfer.timeout = timeout;
    }
}

impl ChannelClient<TcpLink> {
    /// 等待服务端宣布端口后发送文件
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let port = self.wait_transfer_port().await?;
        let outgoing = Outgoing::open(path.as_ref()).await?;
        let mut stream = dial(self.peer_addr(), port, &self.transfer).await?;
        outgoing.write_to(&mut stream).await
    }

    pub async fn recv_file(&self) -> Result<PathBuf> {
        let stream = self.open_transfer().await?;
        transfer::recv_file(stream, &self.transfer.download_dir).await
    }

    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<BatchReport> {
        let mut stream = self
            .open_transfer()
            .await
            .map_err(transfer::batch_handshake)?;
        transfer::send_files(&mut stream, &transfer::named(paths)).await
    }

    pub async fn recv_files(&self) -> Result<BatchReport> {
        let stream = self
            .open_transfer()
            .await
            .map_err(transfer::batch_handshake)?;
        transfer::recv_files(stream, &self.transfer.download_dir).await
    }

    async fn wait_transfer_port(&self) -> Result<u16> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.shared.rendezvous.wait(self.transfer.timeout).await
    }

    async fn open_transfer(&self) -> Result<TcpStream> {
        let port = self.wait_transfer_port().await?;
        dial(self.peer_addr(), port, &self.transfer).await
    }
}

impl<L: Link> Drop for ChannelClient<L> {
    fn drop(&mut self) {
        // 让接收任务退出
        self.shared.notified.store(true, Ordering::SeqCst);
        self.shared.closed.send_replace(true);
    }
}

async fn receive_loop<L: Link>(
    shared: Arc<Shared<L::Writer>>,
    mut reader: L::Reader,
    mut timeout_rx: watch::Receiver<Option<Duration>>,
) {
    let mut closed_rx = shared.closed.subscribe();
    loop {
        let received = tokio::select! {
            received = reader.recv() => received,
            changed = timeout_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let recv_timeout = *timeout_rx.borrow_and_update();
                reader.set_recv_timeout(recv_timeout);
                continue;
            }
            _ = closed(&mut closed_rx) => break,
        };

        match received {
            Ok(msg) if msg.opcode() == FT_TRANSFER_PORT => match msg.parse::<TransferPort>() {
                Ok(TransferPort { port }) => {
                    debug!("Transfer port {} announced by {}", port, shared.peer_addr);
                    shared.rendezvous.offer(port).await;
                }
                Err(e) => warn!("Bad transfer port message: {}", e),
            },
            Ok(msg) => shared.handlers.dispatch(&shared.peer_addr, &msg),
            Err(Error::Timeout) => {}
            Err(e) if !L::is_fatal(&e) => debug!("Ignoring receive error from {}: {}", shared.peer_addr, e),
            Err(e) => {
                shared.disconnect(&e).await;
                break;
            }
        }
    }
    debug!("Receive task for {} finished", shared.peer_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{TcpChannelClient, UdpChannelClient};
    use crate::handler::Dispatch;
    use crate::server::{SelectServer, Server, UdpServer};
    use crate::transport::TcpListener;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    async fn spawn_select(server: SelectServer) -> (Arc<SelectServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(server);
        tokio::spawn(server.clone().serve(listener));
        (server, addr)
    }

    #[tokio::test]
    async fn test_channel_dispatch() {
        let mut server = SelectServer::new();
        server.set_message_handler(|conn, msg| {
            let text = msg.get("text").ok().flatten().cloned();
            let reply = json!({"reply": text});
            let _ = conn.send(&Message::json(1, reply.as_object().unwrap().clone()));
            let _ = conn.send(&Message::plain_text(2, "second"));
        });
        let (server, addr) = spawn_select(server).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handlers = Handlers::new();
        let tx2 = tx.clone();
        handlers
            .set_opcode_handler(1, move |_, msg| {
                let _ = tx.send(format!("op1 {}", msg.get("reply").unwrap().unwrap()));
                Dispatch::Handled
            })
            .set_message_handler(move |_, msg| {
                let _ = tx2.send(format!("generic {}", msg.text().unwrap_or_default()));
            });

        let client = TcpChannelClient::connect(&addr, handlers, ClientConfig::default())
            .await
            .unwrap();
        client
            .send(&Message::json(0, json!({"text": "hi"}).as_object().unwrap().clone()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "op1 \"hi\"");
        assert_eq!(rx.recv().await.unwrap(), "generic second");
        client.close().await;
        server.stop();
    }

    #[tokio::test]
    async fn test_disconnect_fires_once() {
        let mut server = SelectServer::new();
        server.set_opcode_handler(990, |conn, _| {
            conn.close();
            Dispatch::Handled
        });
        let (server, addr) = spawn_select(server).await;

        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut handlers = Handlers::new();
        let d = disconnects.clone();
        handlers.set_disconnected_handler(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let client = TcpChannelClient::connect(&addr, handlers, ClientConfig::default())
            .await
            .unwrap();

        client.send(&Message::header_only(990)).await.unwrap();
        // 接收任务和发送路径同时发现故障
        for _ in 0..20 {
            let _ = client.send(&Message::header_only(1)).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_closed());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            client.send(&Message::header_only(1)).await,
            Err(Error::Closed)
        ));
        server.stop();
    }

    #[tokio::test]
    async fn test_close_suppresses_notification() {
        let (server, addr) = spawn_select(SelectServer::new()).await;
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut handlers = Handlers::new();
        let d = disconnects.clone();
        handlers.set_disconnected_handler(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let client = TcpChannelClient::connect(&addr, handlers, ClientConfig::default())
            .await
            .unwrap();
        client.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_closed());
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        server.stop();
    }

    #[tokio::test]
    async fn test_transfer_timeout_keeps_connection() {
        let mut server = SelectServer::new();
        server.set_message_handler(|conn, msg| {
            let _ = conn.send(msg);
        });
        let (server, addr) = spawn_select(server).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handlers = Handlers::new();
        handlers.set_message_handler(move |_, msg| {
            let _ = tx.send(msg.clone());
        });
        let mut client = TcpChannelClient::connect(&addr, handlers, ClientConfig::default())
            .await
            .unwrap();
        client.set_transfer_timeout(Duration::from_millis(50));

        assert!(matches!(
            client.recv_file().await,
            Err(Error::TransferTimeout(_))
        ));
        assert!(!client.is_closed());
        client.send(&Message::plain_text(4, "still here")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::plain_text(4, "still here"));
        server.stop();
    }

    #[tokio::test]
    async fn test_server_pushes_file() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("pushed.bin");
        let data = vec![0x5Au8; 3000];
        tokio::fs::write(&path, &data).await.unwrap();

        let mut server = SelectServer::new();
        server.set_opcode_handler(101, move |conn, _| {
            let conn = conn.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let _ = conn.send_file(&path).await;
            });
            Dispatch::Handled
        });
        let (server, addr) = spawn_select(server).await;

        let download = TempDir::new().unwrap();
        let config = ClientConfig {
            transfer: TransferConfig {
                download_dir: download.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let client = TcpChannelClient::connect(&addr, Handlers::new(), config)
            .await
            .unwrap();
        client.send(&Message::header_only(101)).await.unwrap();
        let saved = client.recv_file().await.unwrap();
        assert_eq!(saved, download.path().join("pushed.bin"));
        assert_eq!(tokio::fs::read(&saved).await.unwrap(), data);
        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_failure_races_receive_eof() {
        let big = Message::binary(3, vec![0u8; 1 << 20]);
        for _ in 0..10 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let disconnects = Arc::new(AtomicUsize::new(0));
            let mut handlers = Handlers::new();
            let d = disconnects.clone();
            handlers.set_disconnected_handler(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            });
            let (client, accepted) = tokio::join!(
                TcpChannelClient::connect(&addr, handlers, ClientConfig::default()),
                listener.accept(),
            );
            let client = client.unwrap();
            let (stream, _) = accepted.unwrap();

            // 对端带着未读数据关闭，发送路径和接收任务几乎同时看到故障
            let (send_error, _) = tokio::join!(
                async {
                    loop {
                        if let Err(e) = client.send(&big).await {
                            break e;
                        }
                    }
                },
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    drop(stream);
                },
            );
            assert!(matches!(send_error, Error::Connection(_) | Error::Closed));
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(client.is_closed());
            assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_missed_handshake_does_not_shift_later_transfers() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("again.txt");
        tokio::fs::write(&path, b"fresh port").await.unwrap();

        let mut server = SelectServer::new();
        server
            .set_transfer_timeout(Duration::from_millis(200))
            .set_opcode_handler(101, move |conn, _| {
                let conn = conn.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    let _ = conn.send_file(&path).await;
                });
                Dispatch::Handled
            });
        let (server, addr) = spawn_select(server).await;

        let download = TempDir::new().unwrap();
        let config = ClientConfig {
            transfer: TransferConfig {
                download_dir: download.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let client = TcpChannelClient::connect(&addr, Handlers::new(), config)
            .await
            .unwrap();

        // 无人等待时到达的端口被丢弃，服务端随后超时关闭监听
        client.send(&Message::header_only(101)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        for _ in 0..2 {
            client.send(&Message::header_only(101)).await.unwrap();
            let saved = client.recv_file().await.unwrap();
            assert_eq!(tokio::fs::read(&saved).await.unwrap(), b"fresh port");
        }
        assert!(!client.is_closed());
        server.stop();
    }

    #[tokio::test]
    async fn test_refused_transfer_keeps_connection() {
        let closed_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut server = SelectServer::new();
        server
            .set_opcode_handler(102, move |conn, _| {
                let announce =
                    Message::from_serialize(FT_TRANSFER_PORT, &TransferPort { port: closed_port })
                        .unwrap();
                let _ = conn.send(&announce);
                Dispatch::Handled
            })
            .set_message_handler(|conn, msg| {
                let _ = conn.send(msg);
            });
        let (server, addr) = spawn_select(server).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handlers = Handlers::new();
        handlers.set_message_handler(move |_, msg| {
            let _ = tx.send(msg.clone());
        });
        let client = TcpChannelClient::connect(&addr, handlers, ClientConfig::default())
            .await
            .unwrap();

        client.send(&Message::header_only(102)).await.unwrap();
        let err = client.recv_file().await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransferIncomplete {
                completed: crate::Progress::Bytes(0),
                ..
            }
        ));
        assert!(!err.is_fatal());

        client.send(&Message::header_only(102)).await.unwrap();
        assert!(matches!(
            client.recv_files().await,
            Err(Error::TransferIncomplete {
                completed: crate::Progress::Files(ref done),
                ..
            }) if done.is_empty()
        ));

        assert!(!client.is_closed());
        client.send(&Message::plain_text(4, "still here")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::plain_text(4, "still here"));
        server.stop();
    }

    #[tokio::test]
    async fn test_udp_channel_client() {
        let mut server = UdpServer::new();
        server.set_message_handler(|peer, msg| {
            let _ = peer.reply(msg);
        });
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let server = Arc::new(server);
        tokio::spawn(server.clone().serve(socket));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handlers = Handlers::new();
        handlers.set_message_handler(move |_, msg| {
            let _ = tx.send(msg.clone());
        });
        let client = UdpChannelClient::connect(&addr, handlers, ClientConfig::default())
            .await
            .unwrap();
        client.send(&Message::binary(6, vec![1, 2, 3])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::binary(6, vec![1, 2, 3]));
        client.close().await;
        server.stop();
    }
}
