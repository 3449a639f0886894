//! 帧消息协议示例服务端
//!
//! 用法: `framelink-server [addr] [select|threading|udp] [share_dir]`

mod server;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use framelink::{SelectServer, Server, ThreadingServer, UdpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:40000";
const DEFAULT_SHARE_DIR: &str = "testfile";

/// 服务端运行模式
#[derive(Debug, Clone, Copy)]
enum Mode {
    Select,
    Threading,
    Udp,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "select" => Ok(Mode::Select),
            "threading" => Ok(Mode::Threading),
            "udp" => Ok(Mode::Udp),
            other => bail!("unknown mode {:?} (expected select, threading or udp)", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("framelink_server=debug".parse()?)
                .add_directive("framelink=debug".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let mode: Mode = args.next().as_deref().unwrap_or("select").parse()?;
    let share_dir = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_SHARE_DIR.to_string()));

    info!("Server starting on {} ({:?} mode)", addr, mode);

    match mode {
        Mode::Select => {
            let mut server = SelectServer::new();
            server::install(&mut server, share_dir);
            run(server, &addr).await
        }
        Mode::Threading => {
            let mut server = ThreadingServer::new();
            server::install(&mut server, share_dir);
            run(server, &addr).await
        }
        Mode::Udp => {
            let mut server = UdpServer::new();
            server::install_udp(&mut server);
            run(server, &addr).await
        }
    }
}

/// 运行服务端直到出错或收到 Ctrl+C
async fn run<S: Server>(server: S, addr: &str) -> Result<()> {
    let server = Arc::new(server);
    let mut running = tokio::spawn({
        let server = Arc::clone(&server);
        let addr = addr.to_string();
        async move { server.start(&addr).await }
    });

    tokio::select! {
        joined = &mut running => joined??,
        // 监听 Ctrl+C 信号
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            server.stop();
            running.await??;
        }
    }

    info!("Server stopped");
    Ok(())
}
