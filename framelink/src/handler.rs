//! 回调注册表
//!
//! 客户端与服务端各自持有一份 [`Handlers`]，在 `connect` / `start` 之前完成注册，
//! 之后只读共享。泛型参数 `C` 是回调收到的上下文:
//! TCP 服务端为 [`Connection`](crate::Connection)，UDP 服务端为
//! [`UdpPeer`](crate::UdpPeer)，客户端为对端地址 `SocketAddr`。

use std::collections::HashMap;
use std::fmt;

use crate::message::Message;

/// 按操作码回调的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// 已处理，不再调用通用回调
    Handled,
    /// 继续调用通用回调
    Continue,
}

impl From<bool> for Dispatch {
    fn from(handled: bool) -> Self {
        if handled {
            Dispatch::Handled
        } else {
            Dispatch::Continue
        }
    }
}

type OpcodeHandler<C> = Box<dyn Fn(&C, &Message) -> Dispatch + Send + Sync>;
type MessageHandler<C> = Box<dyn Fn(&C, &Message) + Send + Sync>;
type EventHandler<C> = Box<dyn Fn(&C) + Send + Sync>;

/// 回调注册表
pub struct Handlers<C> {
    by_opcode: HashMap<u16, OpcodeHandler<C>>,
    on_message: Option<MessageHandler<C>>,
    on_connected: Option<EventHandler<C>>,
    on_disconnected: Option<EventHandler<C>>,
}

impl<C> Handlers<C> {
    pub fn new() -> Self {
        Self {
            by_opcode: HashMap::new(),
            on_message: None,
            on_connected: None,
            on_disconnected: None,
        }
    }

    /// 设置收到指定操作码报文时的回调，先于通用回调执行
    pub fn set_opcode_handler<F>(&mut self, opcode: u16, handler: F) -> &mut Self
    where
        F: Fn(&C, &Message) -> Dispatch + Send + Sync + 'static,
    {
        self.by_opcode.insert(opcode, Box::new(handler));
        self
    }

    /// 取消指定操作码的回调
    pub fn remove_opcode_handler(&mut self, opcode: u16) -> &mut Self {
        self.by_opcode.remove(&opcode);
        self
    }

    /// 设置收到报文时的通用回调
    pub fn set_message_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&C, &Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Box::new(handler));
        self
    }

    pub fn set_connected_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.on_connected = Some(Box::new(handler));
        self
    }

    pub fn set_disconnected_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.on_disconnected = Some(Box::new(handler));
        self
    }

    /// 分发一条消息: 操作码回调返回 `Handled` 时跳过通用回调
    pub fn dispatch(&self, ctx: &C, msg: &Message) {
        if let Some(handler) = self.by_opcode.get(&msg.opcode()) {
            if handler(ctx, msg) == Dispatch::Handled {
                return;
            }
        }
        if let Some(handler) = &self.on_message {
            handler(ctx, msg);
        }
    }

    pub fn notify_connected(&self, ctx: &C) {
        if let Some(handler) = &self.on_connected {
            handler(ctx);
        }
    }

    pub fn notify_disconnected(&self, ctx: &C) {
        if let Some(handler) = &self.on_disconnected {
            handler(ctx);
        }
    }
}

impl<C> Default for Handlers<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Handlers<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut opcodes: Vec<_> = self.by_opcode.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("Handlers")
            .field("opcodes", &opcodes)
            .field("on_message", &self.on_message.is_some())
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .finish()
    }
}
