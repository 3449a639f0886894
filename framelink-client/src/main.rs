//! 帧消息协议示例客户端
//!
//! 用法: `framelink-client [addr] [channel|reqres|udp] [share_dir]`
//!
//! 每行输入一个操作码发送一条消息，100/101/110/111 触发文件传输，非数字输入退出。

mod client;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:40000";
const DEFAULT_SHARE_DIR: &str = "testfile";

/// 客户端角色
#[derive(Debug, Clone, Copy)]
enum Mode {
    Channel,
    ReqRes,
    Udp,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "channel" => Ok(Mode::Channel),
            "reqres" => Ok(Mode::ReqRes),
            "udp" => Ok(Mode::Udp),
            other => bail!("unknown mode {:?} (expected channel, reqres or udp)", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("framelink_client=debug".parse()?)
                .add_directive("framelink=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let mode: Mode = args.next().as_deref().unwrap_or("channel").parse()?;
    let share_dir = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_SHARE_DIR.to_string()));

    info!("Connecting to {} ({:?} mode)", addr, mode);

    match mode {
        Mode::Channel => client::run_channel(&addr, &share_dir).await,
        Mode::ReqRes => client::run_reqres(&addr, &share_dir).await,
        Mode::Udp => client::run_udp(&addr).await,
    }
}
