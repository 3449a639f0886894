//! 单任务多路复用服务端
//!
//! 所有连接的读取端汇入一个 `StreamMap`，由同一个任务轮询。每个连接同一时间
//! 最多只有一条已收到、尚未分发的消息；回调在循环内同步执行，耗时的工作应
//! 交给其他任务。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::sync::watch;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

use super::{Server, ServerConfig};
use crate::connection::{closed, Connection, Inbound};
use crate::error::{Error, Result};
use crate::handler::Handlers;
use crate::message::Message;
use crate::transport::TcpListener;

type InboundStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// 多路复用服务端
pub struct SelectServer {
    handlers: Handlers<Connection>,
    config: ServerConfig,
    shutdown_tx: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl SelectServer {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handlers: Handlers::new(),
            config,
            shutdown_tx,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_transfer_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.transfer.timeout = timeout;
        self
    }

    /// 在已绑定的监听器上运行事件循环
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Select server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut inbound: StreamMap<u64, InboundStream> = StreamMap::new();
        let mut live: HashMap<u64, Connection> = HashMap::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    match Connection::open(stream, id, &self.config) {
                        Ok((conn, reader)) => {
                            info!("Connection {} from {}", id, peer);
                            inbound.insert(id, into_stream(reader));
                            live.insert(id, conn.clone());
                            self.handlers.notify_connected(&conn);
                        }
                        Err(e) => warn!("Failed to set up connection from {}: {}", peer, e),
                    }
                }

                Some((id, received)) = inbound.next(), if !inbound.is_empty() => {
                    match received {
                        Ok(msg) => {
                            if let Some(conn) = live.get(&id) {
                                debug!("Connection {} received {}", id, msg);
                                self.handlers.dispatch(conn, &msg);
                            }
                        }
                        Err(e) if !e.is_fatal() => debug!("Connection {}: {}", id, e),
                        Err(e) => {
                            inbound.remove(&id);
                            if let Some(conn) = live.remove(&id) {
                                self.teardown(&conn, &e);
                            }
                        }
                    }
                }

                _ = closed(&mut shutdown_rx) => break,
            }
        }

        info!("Select server stopping, closing {} connections", live.len());
        for (_, conn) in live.drain() {
            self.teardown(&conn, &Error::Closed);
        }
        Ok(())
    }

    /// 关闭连接并触发断开回调，每个连接只经过这里一次
    fn teardown(&self, conn: &Connection, reason: &Error) {
        conn.close();
        match reason {
            Error::Closed => info!("Connection {} closed", conn.id()),
            Error::EmptyFrame => info!("Connection {} disconnected", conn.id()),
            e => warn!("Connection {} dropped: {}", conn.id(), e),
        }
        self.handlers.notify_disconnected(conn);
    }
}

impl Default for SelectServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Server for SelectServer {
    type Context = Connection;

    fn handlers_mut(&mut self) -> &mut Handlers<Connection> {
        &mut self.handlers
    }

    async fn start(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

fn into_stream(reader: Inbound) -> InboundStream {
    Box::pin(stream::unfold(reader, |mut reader| async move {
        let received = reader.next().await;
        Some((received, reader))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, TcpReqResClient};
    use crate::handler::Dispatch;
    use crate::transport::{Link, TcpLink, TransportConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn spawn(server: SelectServer) -> (Arc<SelectServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(server);
        tokio::spawn(server.clone().serve(listener));
        (server, addr)
    }

    fn hello_server() -> SelectServer {
        let mut server = SelectServer::new();
        server.set_message_handler(|conn, msg| {
            if msg.opcode() == 0 {
                let reply = json!({"reply": format!("hello {}", msg.opcode())});
                let _ = conn.send(&Message::json(1, reply.as_object().unwrap().clone()));
            }
        });
        server
    }

    #[tokio::test]
    async fn test_request_gets_reply() {
        let (server, addr) = spawn(hello_server()).await;
        let mut client = TcpReqResClient::connect(&addr, Handlers::new(), ClientConfig::default())
            .await
            .unwrap();

        let request = Message::json(0, json!({"text": "hi"}).as_object().unwrap().clone());
        let reply = client.request(&request).await.unwrap().unwrap();
        assert_eq!(
            reply,
            Message::json(1, json!({"reply": "hello 0"}).as_object().unwrap().clone())
        );
        server.stop();
    }

    #[tokio::test]
    async fn test_opcode_handler_precedence() {
        let generic = Arc::new(AtomicUsize::new(0));
        let mut server = SelectServer::new();
        let g = generic.clone();
        server
            .set_opcode_handler(7, |conn, _| {
                let _ = conn.send(&Message::plain_text(7, "specific"));
                Dispatch::Handled
            })
            .set_message_handler(move |conn, _| {
                g.fetch_add(1, Ordering::SeqCst);
                let _ = conn.send(&Message::plain_text(8, "generic"));
            });
        let (server, addr) = spawn(server).await;

        let link = TcpLink::connect(&addr, &TransportConfig::default()).await.unwrap();
        let (mut reader, mut writer) = link.split();
        writer.send(&Message::header_only(7)).await.unwrap();
        assert_eq!(reader.recv().await.unwrap().text(), Some("specific"));
        writer.send(&Message::header_only(9)).await.unwrap();
        assert_eq!(reader.recv().await.unwrap().text(), Some("generic"));
        assert_eq!(generic.load(Ordering::SeqCst), 1);
        server.stop();
    }

    #[tokio::test]
    async fn test_close_from_handler_notifies_once() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut server = SelectServer::new();
        let d = disconnects.clone();
        server
            .set_opcode_handler(990, |conn, _| {
                conn.close();
                // 同一循环内再次关闭不应产生第二次通知
                conn.close();
                Dispatch::Handled
            })
            .set_disconnected_handler(move |conn| {
                d.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(conn.id());
            });
        let (server, addr) = spawn(server).await;

        let link = TcpLink::connect(&addr, &TransportConfig::default()).await.unwrap();
        let (mut reader, mut writer) = link.split();
        writer.send(&Message::header_only(990)).await.unwrap();
        assert!(matches!(reader.recv().await, Err(Error::EmptyFrame)));

        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_disconnects_everyone() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        let mut server = SelectServer::new();
        let (d, c) = (disconnects.clone(), connects.clone());
        server
            .set_connected_handler(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .set_disconnected_handler(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(server);
        let running = tokio::spawn(server.clone().serve(listener));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let link = TcpLink::connect(&addr, &TransportConfig::default()).await.unwrap();
            readers.push(link.split());
        }
        while connects.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.stop();
        running.await.unwrap().unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 3);
        for (reader, _) in readers.iter_mut() {
            assert!(matches!(reader.recv().await, Err(Error::EmptyFrame)));
        }
    }
}
