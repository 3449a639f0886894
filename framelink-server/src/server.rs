//! 示例服务端的回调
//!
//! | 操作码 | 行为 |
//! |---|---|
//! | 0, 1 | 回复 `{"reply": "hello <opcode>"}`，操作码 1 |
//! | 990 | 立即断开连接 |
//! | 991 | 在另一个任务中 2 秒后断开连接 |
//! | 100 / 110 | 接收客户端上传的一个 / 多个文件 |
//! | 101 / 111 | 向客户端发送一个 / 多个文件 |

use std::path::{Path, PathBuf};
use std::time::Duration;

use framelink::{Connection, Message, Server, UdpServer};
use serde_json::json;
use tracing::{debug, info, warn};

pub const OP_HELLO: u16 = 0;
pub const OP_HELLO_AGAIN: u16 = 1;
pub const OP_REPLY: u16 = 1;
pub const OP_CLOSE: u16 = 990;
pub const OP_CLOSE_LATER: u16 = 991;
pub const OP_UPLOAD: u16 = 100;
pub const OP_DOWNLOAD: u16 = 101;
pub const OP_UPLOAD_MANY: u16 = 110;
pub const OP_DOWNLOAD_MANY: u16 = 111;

const CLOSE_DELAY: Duration = Duration::from_secs(2);

/// 为 TCP 服务端注册回调
pub fn install<S>(server: &mut S, share_dir: PathBuf)
where
    S: Server<Context = Connection>,
{
    server
        .set_connected_handler(|conn| info!("{} connected", conn.peer_addr()))
        .set_disconnected_handler(|conn| info!("{} disconnected", conn.peer_addr()))
        .set_message_handler(move |conn, msg| handle(conn, msg, &share_dir));
}

/// 为 UDP 服务端注册回调，只支持问候
pub fn install_udp(server: &mut UdpServer) {
    server.set_message_handler(|peer, msg| {
        info!("{} -> {}", peer.addr(), msg);
        if let Some(reply) = hello(msg) {
            if let Err(e) = peer.reply(&reply) {
                warn!("Reply to {} failed: {}", peer.addr(), e);
            }
        }
    });
}

fn hello(msg: &Message) -> Option<Message> {
    if !matches!(msg.opcode(), OP_HELLO | OP_HELLO_AGAIN) {
        return None;
    }
    if let Ok(Some(text)) = msg.get("text") {
        debug!("text: {}", text);
    }
    let reply = json!({ "reply": format!("hello {}", msg.opcode()) });
    Message::from_serialize(OP_REPLY, &reply).ok()
}

fn handle(conn: &Connection, msg: &Message, share_dir: &Path) {
    info!("{} -> {}", conn.peer_addr(), msg);
    if let Some(reply) = hello(msg) {
        if let Err(e) = conn.send(&reply) {
            warn!("Reply to {} failed: {}", conn.peer_addr(), e);
        }
        return;
    }

    match msg.opcode() {
        OP_CLOSE => {
            info!("Closing {} on request", conn.peer_addr());
            conn.close();
        }
        OP_CLOSE_LATER => {
            let conn = conn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CLOSE_DELAY).await;
                info!("Closing {} from another task", conn.peer_addr());
                conn.close();
            });
        }
        OP_UPLOAD => {
            let conn = conn.clone();
            tokio::spawn(async move {
                match conn.recv_file().await {
                    Ok(path) => info!("Received file {:?}", path),
                    Err(e) => warn!("Upload from {} failed: {}", conn.peer_addr(), e),
                }
            });
        }
        OP_DOWNLOAD => {
            let conn = conn.clone();
            let path = share_dir.join("test1.txt");
            tokio::spawn(async move {
                match conn.send_file(&path).await {
                    Ok(size) => info!("Sent {:?} ({} bytes)", path, size),
                    Err(e) => warn!("Download by {} failed: {}", conn.peer_addr(), e),
                }
            });
        }
        OP_UPLOAD_MANY => {
            let conn = conn.clone();
            tokio::spawn(async move {
                match conn.recv_files().await {
                    Ok(report) => info!(
                        "Received files {:?}, discarded {}",
                        report.transferred,
                        report.failed.len()
                    ),
                    Err(e) => warn!("Upload from {} failed: {}", conn.peer_addr(), e),
                }
            });
        }
        OP_DOWNLOAD_MANY => {
            let conn = conn.clone();
            let paths = vec![share_dir.join("test1.txt"), share_dir.join("test2.txt")];
            tokio::spawn(async move {
                match conn.send_files(&paths).await {
                    Ok(report) => info!(
                        "Sent {} files, skipped {:?}",
                        report.transferred.len(),
                        report.failed
                    ),
                    Err(e) => warn!("Download by {} failed: {}", conn.peer_addr(), e),
                }
            });
        }
        _ => {}
    }
}
