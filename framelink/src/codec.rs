//! 帧编解码
//!
//! 帧格式:
//! ```text
//! ┌──────────────────┬───────────────┬───────────────┬──────────────────────┐
//! │ ContentType (2B) │  Opcode (2B)  │  Length (4B)  │       Payload        │
//! │     u16 LE       │    u16 LE     │    u32 LE     │  按内容码解释的正文  │
//! └──────────────────┴───────────────┴───────────────┴──────────────────────┘
//! ```

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::{HEADER_LEN, MAX_FRAME_SIZE, RECV_CHUNK_SIZE};

/// 报文内容码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ContentType {
    /// 只含报头
    HeaderOnly = 0x1,
    /// 纯文本
    PlainText = 0x2,
    /// JSON 对象
    JsonObject = 0x3,
    /// 二进制串
    Binary = 0x4,
}

impl TryFrom<u16> for ContentType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x1 => Ok(ContentType::HeaderOnly),
            0x2 => Ok(ContentType::PlainText),
            0x3 => Ok(ContentType::JsonObject),
            0x4 => Ok(ContentType::Binary),
            other => Err(Error::MalformedHeader(format!(
                "unknown content type {:#06x}",
                other
            ))),
        }
    }
}

/// 8 字节定长报头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub content_type: ContentType,
    pub opcode: u16,
    /// 紧随其后的正文字节数
    pub length: u32,
}

impl Header {
    pub fn new(content_type: ContentType, opcode: u16, length: u32) -> Self {
        Self {
            content_type,
            opcode,
            length,
        }
    }

    /// 编码为小端序的 8 字节
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&(self.content_type as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&self.opcode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// 从原始字节解析报头
    ///
    /// 0 字节视为对端已关闭（`EmptyFrame`），不足 8 字节视为 `MalformedHeader`。
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::EmptyFrame);
        }
        if data.len() != HEADER_LEN {
            return Err(Error::MalformedHeader(format!(
                "expected {} header bytes, got {}",
                HEADER_LEN,
                data.len()
            )));
        }
        let content_type = ContentType::try_from(u16::from_le_bytes([data[0], data[1]]))?;
        let opcode = u16::from_le_bytes([data[2], data[3]]);
        let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Ok(Self::new(content_type, opcode, length))
    }
}

/// 帧读取器
///
/// 已读到的部分帧保存在内部缓冲区中，因此 `recv` 超时后再次调用会从断点继续，
/// 不会丢失或错位。每次只向底层请求当前帧仍缺少的字节（且不超过
/// `RECV_CHUNK_SIZE`），从不越过帧边界读取。
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    header: Option<Header>,
    max_frame_size: usize,
    recv_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 创建新的帧读取器
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(RECV_CHUNK_SIZE),
            header: None,
            max_frame_size: MAX_FRAME_SIZE,
            recv_timeout: None,
        }
    }

    /// 设置允许的最大正文长度
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// 设置接收超时，`None` 表示一直等待
    pub fn set_recv_timeout(&mut self, recv_timeout: Option<Duration>) {
        self.recv_timeout = recv_timeout;
    }

    /// 是否有读到一半的帧
    pub fn has_partial_frame(&self) -> bool {
        self.header.is_some() || !self.buffer.is_empty()
    }

    /// 读取并解码一帧消息（不受接收超时约束）
    pub async fn read_frame(&mut self) -> Result<Message> {
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        loop {
            if self.header.is_none() && self.buffer.len() >= HEADER_LEN {
                let raw = self.buffer.split_to(HEADER_LEN);
                let header = Header::decode(&raw)?;
                let size = header.length as usize;
                if size > self.max_frame_size {
                    return Err(Error::FrameTooLarge {
                        size,
                        max: self.max_frame_size,
                    });
                }
                self.header = Some(header);
            }

            let missing = match self.header {
                Some(header) => {
                    let length = header.length as usize;
                    if self.buffer.len() >= length {
                        let payload = self.buffer.split_to(length).freeze();
                        self.header = None;
                        return Message::from_parts(header, payload);
                    }
                    length - self.buffer.len()
                }
                None => HEADER_LEN - self.buffer.len(),
            };

            let wanted = missing.min(RECV_CHUNK_SIZE);
            let n = self.reader.read(&mut chunk[..wanted]).await?;
            if n == 0 {
                return Err(self.eof_error());
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// 接收消息，受 `recv_timeout` 约束
    pub async fn recv(&mut self) -> Result<Message> {
        match self.recv_timeout {
            Some(limit) => timeout(limit, self.read_frame())
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.read_frame().await,
        }
    }

    /// 取回底层读取端（只应在帧边界处调用）
    pub fn into_inner(self) -> R {
        self.reader
    }

    fn eof_error(&self) -> Error {
        match self.header {
            None if self.buffer.is_empty() => Error::EmptyFrame,
            None => Error::MalformedHeader(format!(
                "stream ended after {} of {} header bytes",
                self.buffer.len(),
                HEADER_LEN
            )),
            Some(header) => Error::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended after {} of {} payload bytes",
                    self.buffer.len(),
                    header.length
                ),
            )),
        }
    }
}

/// 帧写入器
pub struct FrameWriter<W> {
    writer: W,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// 创建新的帧写入器
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// 设置允许的最大正文长度
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// 编码并写入一帧消息
    pub async fn write_frame(&mut self, msg: &Message) -> Result<()> {
        let frame = msg.to_bytes()?;
        self.write_encoded(&frame).await
    }

    /// 写入已编码好的完整帧
    pub async fn write_encoded(&mut self, frame: &[u8]) -> Result<()> {
        let size = frame.len().saturating_sub(HEADER_LEN);
        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        // write_all 内部循环处理部分写入
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 发送消息（write_frame 的别名）
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.write_frame(msg).await
    }

    /// 关闭写方向
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
