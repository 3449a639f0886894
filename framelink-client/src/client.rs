//! 控制台客户端循环

use std::fmt::Debug;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use framelink::{
    ClientConfig, Handlers, Message, TcpChannelClient, TcpReqResClient, UdpReqResClient,
};
use serde_json::json;
use tokio::io::{stdin, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::warn;

const OP_UPLOAD: u16 = 100;
const OP_DOWNLOAD: u16 = 101;
const OP_UPLOAD_MANY: u16 = 110;
const OP_DOWNLOAD_MANY: u16 = 111;

/// 等待响应的时间
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

type Input = Lines<BufReader<Stdin>>;

/// 读取一个操作码，非数字或输入结束时返回 `None`
async fn next_opcode(input: &mut Input) -> Result<Option<u16>> {
    print!(">>> ");
    std::io::stdout().flush()?;
    Ok(input
        .next_line()
        .await?
        .and_then(|line| line.trim().parse().ok()))
}

fn text_message(opcode: u16) -> Result<Message> {
    let body = json!({ "text": format!("test message<{}> send by client", opcode) });
    Ok(Message::from_serialize(opcode, &body)?)
}

fn printing_handlers() -> Handlers<SocketAddr> {
    let mut handlers = Handlers::new();
    handlers
        .set_message_handler(|_, msg| println!("{}", msg))
        .set_connected_handler(|addr| println!("connected to {}", addr))
        .set_disconnected_handler(|addr| println!("disconnected from {}", addr));
    handlers
}

fn report<T: Debug>(what: &str, result: framelink::Result<T>) {
    match result {
        Ok(value) => println!("{}: {:?}", what, value),
        Err(e) => warn!("{} failed: {}", what, e),
    }
}

/// 通道客户端: 收到的消息由接收任务打印
pub async fn run_channel(addr: &str, share_dir: &Path) -> Result<()> {
    let client =
        TcpChannelClient::connect(addr, printing_handlers(), ClientConfig::default()).await?;
    let mut input = BufReader::new(stdin()).lines();
    let files = [share_dir.join("test1.txt"), share_dir.join("test2.txt")];

    while let Some(opcode) = next_opcode(&mut input).await? {
        if client.is_closed() {
            println!("client is closed");
            break;
        }
        match opcode {
            OP_UPLOAD | OP_DOWNLOAD | OP_UPLOAD_MANY | OP_DOWNLOAD_MANY => {
                client.send(&Message::header_only(opcode)).await?;
            }
            _ => {
                if let Err(e) = client.send(&text_message(opcode)?).await {
                    warn!("Send failed: {}", e);
                }
                continue;
            }
        }
        match opcode {
            OP_UPLOAD => report("send file", client.send_file(&files[0]).await),
            OP_DOWNLOAD => report("recv file", client.recv_file().await),
            OP_UPLOAD_MANY => report("send files", client.send_files(&files).await),
            _ => report("recv files", client.recv_files().await),
        }
    }

    client.close().await;
    Ok(())
}

/// 请求/响应客户端: 每条消息等待一条响应
pub async fn run_reqres(addr: &str, share_dir: &Path) -> Result<()> {
    let mut client =
        TcpReqResClient::connect(addr, printing_handlers(), ClientConfig::default()).await?;
    client.set_recv_timeout(Some(RECV_TIMEOUT));
    let mut input = BufReader::new(stdin()).lines();
    let files = [share_dir.join("test1.txt"), share_dir.join("test2.txt")];

    while let Some(opcode) = next_opcode(&mut input).await? {
        if client.is_closed() {
            println!("client is closed");
            break;
        }
        match opcode {
            OP_UPLOAD | OP_DOWNLOAD | OP_UPLOAD_MANY | OP_DOWNLOAD_MANY => {
                client.send(&Message::header_only(opcode)).await?;
            }
            _ => {
                report("request", client.request(&text_message(opcode)?).await);
                continue;
            }
        }
        match opcode {
            OP_UPLOAD => report("send file", client.send_file(&files[0]).await),
            OP_DOWNLOAD => report("recv file", client.recv_file().await),
            OP_UPLOAD_MANY => report("send files", client.send_files(&files).await),
            _ => report("recv files", client.recv_files().await),
        }
    }

    client.close().await;
    Ok(())
}

/// UDP 请求/响应客户端
pub async fn run_udp(addr: &str) -> Result<()> {
    let config = ClientConfig::default().with_recv_timeout(RECV_TIMEOUT);
    let mut client = UdpReqResClient::connect(addr, Handlers::new(), config).await?;
    let mut input = BufReader::new(stdin()).lines();

    while let Some(opcode) = next_opcode(&mut input).await? {
        match client.request(&text_message(opcode)?).await {
            Ok(Some(reply)) => println!("{}", reply),
            Ok(None) => println!("no response"),
            Err(e) => warn!("Request failed: {}", e),
        }
    }

    client.close().await;
    Ok(())
}
