//! 帧消息协议库
//!
//! 包含:
//! - 报头与帧编解码 (Header, FrameReader, FrameWriter)
//! - 消息类型 (Message, Body, Content)
//! - 传输层抽象 (Link) 及 TCP / UDP 实现
//! - 文件传输子协议
//! - 回调注册表 (Handlers)
//! - 客户端角色 (ChannelClient, ReqResClient)
//! - 服务端角色 (SelectServer, ThreadingServer, UdpServer)

mod codec;
mod connection;
mod constants;
mod error;
mod handler;
mod message;

pub mod client;
pub mod server;
pub mod transfer;
pub mod transport;

pub use client::{
    ChannelClient, ClientConfig, ReqResClient, TcpChannelClient, TcpReqResClient,
    UdpChannelClient, UdpReqResClient,
};
pub use codec::{ContentType, FrameReader, FrameWriter, Header};
pub use connection::Connection;
pub use constants::*;
pub use error::{Error, Progress, Result};
pub use handler::{Dispatch, Handlers};
pub use message::{Body, Content, Message};
pub use server::{SelectServer, Server, ServerConfig, ThreadingServer, UdpPeer, UdpServer};
pub use transfer::{BatchReport, TransferConfig};
pub use transport::{Link, LinkReader, LinkWriter, TcpLink, TcpListener, TransportConfig, UdpLink};
