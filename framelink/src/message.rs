//! 消息类型定义

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::{DeserializeOwned, Error as _};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec::{ContentType, Header};
use crate::error::{Error, Result};
use crate::HEADER_LEN;

/// 已定型的正文，变体与内容码一一对应
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    HeaderOnly,
    PlainText(String),
    /// 原始文本与解析后的对象同时保留
    Json {
        text: String,
        object: Map<String, Value>,
    },
    Binary(Bytes),
}

impl Body {
    pub fn content_type(&self) -> ContentType {
        match self {
            Body::HeaderOnly => ContentType::HeaderOnly,
            Body::PlainText(_) => ContentType::PlainText,
            Body::Json { .. } => ContentType::JsonObject,
            Body::Binary(_) => ContentType::Binary,
        }
    }
}

/// 未定型的正文，配合 [`Message::new`] 按运行期内容码构造消息
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Empty,
    Text(String),
    Bytes(Bytes),
}

impl Content {
    fn kind(&self) -> &'static str {
        match self {
            Content::Empty => "empty",
            Content::Text(_) => "text",
            Content::Bytes(_) => "bytes",
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<Vec<u8>> for Content {
    fn from(data: Vec<u8>) -> Self {
        Content::Bytes(Bytes::from(data))
    }
}

impl From<Bytes> for Content {
    fn from(data: Bytes) -> Self {
        Content::Bytes(data)
    }
}

/// 一条完整的报文，构造后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    opcode: u16,
    body: Body,
}

impl Message {
    /// 不含正文的消息
    pub fn header_only(opcode: u16) -> Self {
        Self {
            opcode,
            body: Body::HeaderOnly,
        }
    }

    /// 正文为纯文本的消息
    pub fn plain_text(opcode: u16, text: impl Into<String>) -> Self {
        Self {
            opcode,
            body: Body::PlainText(text.into()),
        }
    }

    /// 正文为 JSON 对象的消息
    pub fn json(opcode: u16, object: Map<String, Value>) -> Self {
        let text = Value::Object(object.clone()).to_string();
        Self {
            opcode,
            body: Body::Json { text, object },
        }
    }

    /// 由 JSON 文本构造，文本必须是一个 JSON 对象
    pub fn json_str(opcode: u16, text: &str) -> Result<Self> {
        Ok(Self {
            opcode,
            body: parse_object(text.to_string())?,
        })
    }

    /// 将可序列化的结构体作为 JSON 正文
    pub fn from_serialize<T: Serialize>(opcode: u16, value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(object) => Ok(Self::json(opcode, object)),
            other => Err(not_an_object(&other)),
        }
    }

    /// 正文为二进制串的消息
    pub fn binary(opcode: u16, data: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            body: Body::Binary(data.into()),
        }
    }

    /// 按运行期给定的内容码构造消息
    ///
    /// 正文与内容码不匹配时返回 `TypeMismatch`，不会做任何隐式转换。
    pub fn new(content_type: ContentType, opcode: u16, content: Content) -> Result<Self> {
        let body = match (content_type, content) {
            (ContentType::HeaderOnly, Content::Empty) => Body::HeaderOnly,
            (ContentType::PlainText, Content::Empty) => Body::PlainText(String::new()),
            (ContentType::PlainText, Content::Text(text)) => Body::PlainText(text),
            (ContentType::JsonObject, Content::Empty) => parse_object(String::new())?,
            (ContentType::JsonObject, Content::Text(text)) => parse_object(text)?,
            (ContentType::Binary, Content::Empty) => Body::Binary(Bytes::new()),
            (ContentType::Binary, Content::Bytes(data)) => Body::Binary(data),
            (content_type, content) => {
                return Err(Error::TypeMismatch(format!(
                    "{} content does not match {:?}",
                    content.kind(),
                    content_type
                )))
            }
        };
        Ok(Self { opcode, body })
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn content_type(&self) -> ContentType {
        self.body.content_type()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// 纯文本或 JSON 消息的文本
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Body::PlainText(text) | Body::Json { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn json_object(&self) -> Option<&Map<String, Value>> {
        match &self.body {
            Body::Json { object, .. } => Some(object),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// 获取 JSON 字段，键不存在时返回 `None`
    pub fn get(&self, key: &str) -> Result<Option<&Value>> {
        match &self.body {
            Body::Json { object, .. } => Ok(object.get(key)),
            _ => Err(self.need_json()),
        }
    }

    /// 将 JSON 正文反序列化为指定类型
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.body {
            Body::Json { object, .. } => Ok(serde_json::from_value(Value::Object(object.clone()))?),
            _ => Err(self.need_json()),
        }
    }

    /// 线上传输的正文字节
    pub fn payload(&self) -> &[u8] {
        match &self.body {
            Body::HeaderOnly => &[],
            Body::PlainText(text) | Body::Json { text, .. } => text.as_bytes(),
            Body::Binary(data) => &data[..],
        }
    }

    /// 根据正文计算报头
    pub fn header(&self) -> Result<Header> {
        let size = self.payload().len();
        let length = u32::try_from(size).map_err(|_| Error::FrameTooLarge {
            size,
            max: u32::MAX as usize,
        })?;
        Ok(Header::new(self.content_type(), self.opcode, length))
    }

    /// 转换为二进制流: 报头 + 正文
    pub fn to_bytes(&self) -> Result<Bytes> {
        let header = self.header()?;
        let payload = self.payload();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_slice(&header.encode());
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// 从一段完整的二进制流解析消息（UDP 数据报使用）
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let header = Header::decode(&raw[..raw.len().min(HEADER_LEN)])?;
        let payload = &raw[HEADER_LEN..];
        if payload.len() != header.length as usize {
            return Err(Error::MalformedHeader(format!(
                "header declares {} payload bytes, datagram carries {}",
                header.length,
                payload.len()
            )));
        }
        Self::from_parts(header, Bytes::copy_from_slice(payload))
    }

    /// 由已解析的报头和正文组成消息
    pub(crate) fn from_parts(header: Header, payload: Bytes) -> Result<Self> {
        let body = match header.content_type {
            ContentType::HeaderOnly if payload.is_empty() => Body::HeaderOnly,
            ContentType::HeaderOnly => {
                return Err(Error::TypeMismatch(format!(
                    "header-only frame carries {} payload bytes",
                    payload.len()
                )))
            }
            ContentType::PlainText => Body::PlainText(String::from_utf8(payload.to_vec())?),
            ContentType::JsonObject => parse_object(String::from_utf8(payload.to_vec())?)?,
            ContentType::Binary => Body::Binary(payload),
        };
        Ok(Self {
            opcode: header.opcode,
            body,
        })
    }

    fn need_json(&self) -> Error {
        Error::TypeMismatch(format!(
            "need a JsonObject message, got {:?}",
            self.content_type()
        ))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Message>({:?}) opcode:{}", self.content_type(), self.opcode)?;
        match &self.body {
            Body::HeaderOnly => Ok(()),
            Body::PlainText(text) | Body::Json { text, .. } => write!(f, " content: {}", text),
            Body::Binary(data) => write!(f, " content: {} bytes", data.len()),
        }
    }
}

/// 空文本视为空对象
fn parse_object(text: String) -> Result<Body> {
    if text.is_empty() {
        return Ok(Body::Json {
            text,
            object: Map::new(),
        });
    }
    match serde_json::from_str::<Value>(&text)? {
        Value::Object(object) => Ok(Body::Json { text, object }),
        other => Err(not_an_object(&other)),
    }
}

fn not_an_object(value: &Value) -> Error {
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    Error::JsonParse(serde_json::Error::custom(format!(
        "expected a JSON object, found {}",
        kind
    )))
}
