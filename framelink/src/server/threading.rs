//! 每连接一个任务的服务端

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Server, ServerConfig};
use crate::connection::{closed, Connection};
use crate::error::{Error, Result};
use crate::handler::Handlers;
use crate::transport::TcpListener;

/// 每连接一个任务的服务端
pub struct ThreadingServer {
    handlers: Handlers<Connection>,
    config: ServerConfig,
    shutdown_tx: watch::Sender<bool>,
    /// 在线连接: id -> Connection
    connections: RwLock<HashMap<u64, Connection>>,
    /// 已占用的连接名额（含尚未登记的连接）
    active: AtomicUsize,
    next_id: AtomicU64,
}

impl ThreadingServer {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handlers: Handlers::new(),
            config,
            shutdown_tx,
            connections: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_transfer_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.transfer.timeout = timeout;
        self
    }

    /// 当前在线连接的快照
    pub async fn connections(&self) -> Vec<Connection> {
        self.connections.read().await.values().cloned().collect()
    }

    /// 在已绑定的监听器上运行 accept 循环
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Threading server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

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
                    if !self.try_add_connection() {
                        warn!("Connection limit reached, rejecting {}", peer);
                        continue;
                    }

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_client(stream).await;
                        server.remove_connection();
                    });
                }

                _ = closed(&mut shutdown_rx) => break,
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn handle_client(&self, stream: TcpStream) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (conn, mut inbound) = match Connection::open(stream, id, &self.config) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Failed to set up connection {}: {}", id, e);
                return;
            }
        };
        self.connections.write().await.insert(id, conn.clone());
        info!("Connection {} from {}", id, conn.peer_addr());
        self.handlers.notify_connected(&conn);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reason = loop {
            tokio::select! {
                received = inbound.next() => match received {
                    Ok(msg) => {
                        debug!("Connection {} received {}", id, msg);
                        self.handlers.dispatch(&conn, &msg);
                    }
                    Err(e) if !e.is_fatal() => debug!("Connection {}: {}", id, e),
                    Err(e) => break e,
                },
                _ = closed(&mut shutdown_rx) => break Error::Closed,
            }
        };

        conn.close();
        self.connections.write().await.remove(&id);
        match reason {
            Error::Closed => info!("Connection {} closed", id),
            Error::EmptyFrame => info!("Connection {} disconnected", id),
            e => warn!("Connection {} dropped: {}", id, e),
        }
        self.handlers.notify_disconnected(&conn);
    }

    /// 占用一个连接名额，超过上限时返回 false
    fn try_add_connection(&self) -> bool {
        loop {
            let current = self.active.load(Ordering::SeqCst);
            if current >= self.config.max_connections {
                return false;
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn remove_connection(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// 等待连接任务退出，最多等待 `shutdown_grace`
    async fn drain(&self) {
        let remaining = self.active.load(Ordering::SeqCst);
        if remaining == 0 {
            return;
        }
        info!("Waiting for {} connections to close...", remaining);

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.active.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "Shutdown grace elapsed with {} connections still open",
                    self.active.load(Ordering::SeqCst)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("All connections closed");
    }
}

impl Default for ThreadingServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Server for ThreadingServer {
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
