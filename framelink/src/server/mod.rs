//! 服务端角色
//!
//! - [`SelectServer`]: 单任务事件循环，同时等待所有连接上的报文，回调在循环内同步执行
//! - [`ThreadingServer`]: 每个连接一个任务
//! - [`UdpServer`]: 单任务数据报循环，不保留对端状态
//!
//! 三者共享 [`Server`] 约定: 在 `start` 之前注册回调，`start` 一直运行到 `stop` 被调用。

mod select;
mod threading;
mod udp;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::handler::{Dispatch, Handlers};
use crate::message::Message;
use crate::transfer::TransferConfig;
use crate::transport::TransportConfig;
use crate::{MAX_CONNECTIONS, SEND_QUEUE_SIZE, SHUTDOWN_GRACE};

pub use select::SelectServer;
pub use threading::ThreadingServer;
pub use udp::{UdpPeer, UdpServer};

/// 服务端配置
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
    /// 同时在线的最大连接数
    pub max_connections: usize,
    /// 每个连接待写出的消息数上限
    pub send_queue_size: usize,
    /// `stop` 后等待连接退出的时间
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            transfer: TransferConfig::default(),
            max_connections: MAX_CONNECTIONS,
            send_queue_size: SEND_QUEUE_SIZE,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// 服务端公共约定
pub trait Server: Send + Sync + Sized + 'static {
    /// 回调收到的上下文
    type Context;

    fn handlers_mut(&mut self) -> &mut Handlers<Self::Context>;

    /// 绑定地址并运行，直到 `stop` 被调用
    fn start(self: Arc<Self>, addr: &str) -> impl Future<Output = Result<()>> + Send;

    /// 停止运行并关闭所有连接
    fn stop(&self);

    fn set_message_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Self::Context, &Message) + Send + Sync + 'static,
    {
        self.handlers_mut().set_message_handler(handler);
        self
    }

    /// 设置指定操作码的回调，返回 `Dispatch::Handled` 时不再调用通用回调
    fn set_opcode_handler<F>(&mut self, opcode: u16, handler: F) -> &mut Self
    where
        F: Fn(&Self::Context, &Message) -> Dispatch + Send + Sync + 'static,
    {
        self.handlers_mut().set_opcode_handler(opcode, handler);
        self
    }

    fn remove_opcode_handler(&mut self, opcode: u16) -> &mut Self {
        self.handlers_mut().remove_opcode_handler(opcode);
        self
    }

    fn set_connected_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Self::Context) + Send + Sync + 'static,
    {
        self.handlers_mut().set_connected_handler(handler);
        self
    }

    fn set_disconnected_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Self::Context) + Send + Sync + 'static,
    {
        self.handlers_mut().set_disconnected_handler(handler);
        self
    }
}
