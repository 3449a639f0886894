//! 文件传输子协议
//!
//! 握手: 持有监听端口的一方在控制连接上发送
//! `FT_TRANSFER_PORT {"port": p}`，另一方随即连接 `(控制连接对端 IP, p)`，
//! 文件数据只走这条专用连接，不占用控制连接。
//!
//! 单文件帧（无报头）:
//! ```text
//! ┌──────────────────┬──────┬─────────────────┬──────────────────────────┐
//! │ filename (UTF-8) │ 0x00 │ filesize u32 LE │ file bytes × filesize    │
//! └──────────────────┴──────┴─────────────────┴──────────────────────────┘
//! ```
//!
//! 多文件: 先发送一条 `FT_SEND_FILES_HEADER {"file_count": n}` 消息，
//! 再依次发送 n 个单文件帧。

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::string::FromUtf8Error;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{Error, Progress, Result};
use crate::message::Message;
use crate::{
    DOWNLOAD_DIR, FILE_CHUNK_SIZE, FT_SEND_FILES_HEADER, FT_TRANSFER_PORT, RECV_CHUNK_SIZE,
    TRANSFER_TIMEOUT,
};

/// 文件名最大字节数
const MAX_FILENAME_LEN: u64 = 4096;

/// `FT_TRANSFER_PORT` 消息正文
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPort {
    pub port: u16,
}

/// `FT_SEND_FILES_HEADER` 消息正文
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesHeader {
    pub file_count: u32,
}

/// 文件传输配置
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// 握手等待时间
    pub timeout: Duration,
    /// 接收文件的保存目录
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: TRANSFER_TIMEOUT,
            download_dir: PathBuf::from(DOWNLOAD_DIR),
        }
    }
}

/// 单文件帧的头部
///
/// 文件名不是合法 UTF-8 时 `filename` 为 `Err`，帧的其余部分仍可按 `size` 读掉。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub filename: std::result::Result<String, FromUtf8Error>,
    pub size: u32,
}

impl FileHeader {
    /// 用于日志和报告的文件名
    fn display_name(&self) -> String {
        match &self.filename {
            Ok(name) => name.clone(),
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

/// 多文件传输结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// 发送方: 已发送的源文件路径；接收方: 已保存的文件路径
    pub transferred: Vec<PathBuf>,
    /// 被跳过的文件及原因
    pub failed: Vec<(PathBuf, String)>,
}

/// 检查待发送的文件名
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() || filename.contains('\0') || filename.len() as u64 > MAX_FILENAME_LEN
    {
        return Err(Error::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// 写入一个单文件帧，返回已发送的正文字节数
pub async fn write_file<W, F>(writer: &mut W, file: &mut F, filename: &str, size: u64) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    F: AsyncRead + Unpin,
{
    validate_filename(filename)?;
    let declared = u32::try_from(size).map_err(|_| Error::FrameTooLarge {
        size: size as usize,
        max: u32::MAX as usize,
    })?;

    let mut head = Vec::with_capacity(filename.len() + 5);
    head.extend_from_slice(filename.as_bytes());
    head.push(0);
    head.extend_from_slice(&declared.to_le_bytes());
    writer
        .write_all(&head)
        .await
        .map_err(|e| incomplete_bytes(0, e))?;

    let mut sent = 0u64;
    let mut chunk = vec![0u8; FILE_CHUNK_SIZE];
    while sent < size {
        let wanted = (size - sent).min(FILE_CHUNK_SIZE as u64) as usize;
        let n = file
            .read(&mut chunk[..wanted])
            .await
            .map_err(|e| incomplete_bytes(sent, e))?;
        if n == 0 {
            return Err(incomplete_bytes(
                sent,
                io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank during transfer"),
            ));
        }
        writer
            .write_all(&chunk[..n])
            .await
            .map_err(|e| incomplete_bytes(sent, e))?;
        sent += n as u64;
    }
    writer.flush().await.map_err(|e| incomplete_bytes(sent, e))?;
    Ok(sent)
}

/// 读取单文件帧的头部，对端在帧开始前关闭时返回 `None`
pub async fn read_file_header<R>(reader: &mut R) -> io::Result<Option<FileHeader>>
where
    R: AsyncBufRead + Unpin,
{
    let mut name = Vec::new();
    let n = (&mut *reader)
        .take(MAX_FILENAME_LEN + 1)
        .read_until(0, &mut name)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if name.pop() != Some(0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "filename is not NUL-terminated",
        ));
    }

    let mut size = [0u8; 4];
    reader.read_exact(&mut size).await?;
    Ok(Some(FileHeader {
        filename: String::from_utf8(name),
        size: u32::from_le_bytes(size),
    }))
}

/// 单个文件帧的接收结果
enum Received {
    Saved(PathBuf),
    /// 帧已被完整读掉，但未能保存
    Skipped { filename: String, reason: Error },
}

async fn receive_one<R>(reader: &mut R, dir: &Path) -> Result<Option<Received>>
where
    R: AsyncBufRead + Unpin,
{
    let header = match read_file_header(reader)
        .await
        .map_err(|e| incomplete_bytes(0, e))?
    {
        Some(header) => header,
        None => return Ok(None),
    };

    let mut target = match &header.filename {
        Ok(filename) => open_target(dir, filename).await,
        Err(e) => Err(Error::TextDecode(e.clone())),
    };
    let mut remaining = header.size as u64;
    let mut received = 0u64;
    let mut chunk = [0u8; RECV_CHUNK_SIZE];
    while remaining > 0 {
        let wanted = remaining.min(RECV_CHUNK_SIZE as u64) as usize;
        let n = reader
            .read(&mut chunk[..wanted])
            .await
            .map_err(|e| incomplete_bytes(received, e))?;
        if n == 0 {
            return Err(incomplete_bytes(
                received,
                io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-file"),
            ));
        }
        // 本地写失败后继续读完该帧，保持与后续帧对齐
        let write_error = match &mut target {
            Ok((path, file)) => match file.write_all(&chunk[..n]).await {
                Ok(()) => None,
                Err(source) => Some(Error::File {
                    path: path.clone(),
                    source,
                }),
            },
            Err(_) => None,
        };
        if let Some(e) = write_error {
            target = Err(e);
        }
        remaining -= n as u64;
        received += n as u64;
    }

    let outcome = match target {
        Ok((path, mut file)) => match file.flush().await {
            Ok(()) => Received::Saved(path),
            Err(source) => Received::Skipped {
                filename: header.display_name(),
                reason: Error::File { path, source },
            },
        },
        Err(reason) => Received::Skipped {
            filename: header.display_name(),
            reason,
        },
    };
    Ok(Some(outcome))
}

/// 只接受单一路径分量的文件名
async fn open_target(dir: &Path, filename: &str) -> Result<(PathBuf, File)> {
    let name = Path::new(filename);
    if filename.is_empty() || name.file_name() != Some(name.as_os_str()) {
        return Err(Error::InvalidFilename(filename.to_string()));
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| Error::File {
            path: dir.to_path_buf(),
            source,
        })?;
    let path = dir.join(name);
    let file = File::create(&path).await.map_err(|source| Error::File {
        path: path.clone(),
        source,
    })?;
    Ok((path, file))
}

/// 接收一个文件，保存到 `dir` 下，返回保存路径
pub async fn recv_file<R>(reader: R, dir: &Path) -> Result<PathBuf>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    match receive_one(&mut reader, dir).await? {
        Some(Received::Saved(path)) => {
            info!("Received file {:?}", path);
            Ok(path)
        }
        Some(Received::Skipped { filename, reason }) => {
            warn!("Discarded file {:?}: {}", filename, reason);
            Err(reason)
        }
        None => Err(incomplete_bytes(
            0,
            io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed before sending a file"),
        )),
    }
}

/// 打开本地文件并发送
pub async fn send_file<W>(writer: &mut W, path: &Path, filename: &str) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    Outgoing::open_as(path, filename)
        .await?
        .write_to(writer)
        .await
}

/// 取路径的最后一个分量作为传输文件名，没有时为空串
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 已打开、待发送的本地文件
///
/// 在握手之前打开，文件不可读时不会占用传输端口。
#[derive(Debug)]
pub(crate) struct Outgoing {
    path: PathBuf,
    filename: String,
    file: File,
    size: u64,
}

impl Outgoing {
    pub(crate) async fn open(path: &Path) -> Result<Self> {
        Self::open_as(path, &file_name_of(path)).await
    }

    async fn open_as(path: &Path, filename: &str) -> Result<Self> {
        validate_filename(filename)?;
        let (file, size) = open_source(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            filename: filename.to_string(),
            file,
            size,
        })
    }

    pub(crate) async fn write_to<W>(mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let sent = write_file(writer, &mut self.file, &self.filename, self.size).await?;
        info!(
            "Sent file {:?} as {:?} ({} bytes)",
            self.path, self.filename, sent
        );
        Ok(sent)
    }
}

/// 以各自的文件名配对待发送路径
pub(crate) fn named(paths: &[PathBuf]) -> Vec<(PathBuf, String)> {
    paths
        .iter()
        .map(|path| (path.clone(), file_name_of(path)))
        .collect()
}

async fn open_source(path: &Path) -> Result<(File, u64)> {
    let file_error = |source| Error::File {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).await.map_err(file_error)?;
    let size = file.metadata().await.map_err(file_error)?.len();
    Ok((file, size))
}

/// 发送多个文件
///
/// 先打开全部文件，无法读取的文件记入 `failed` 且不计入 `file_count`，
/// 其余文件按顺序发送。
pub async fn send_files<W>(writer: &mut W, files: &[(PathBuf, String)]) -> Result<BatchReport>
where
    W: AsyncWrite + Unpin,
{
    let mut report = BatchReport::default();
    let mut opened = Vec::with_capacity(files.len());
    for (path, filename) in files {
        let checked = match validate_filename(filename) {
            Ok(()) => open_source(path).await,
            Err(e) => Err(e),
        };
        match checked {
            Ok((file, size)) => opened.push((path, filename, file, size)),
            Err(e) => {
                warn!("Skipping {:?}: {}", path, e);
                report.failed.push((path.clone(), e.to_string()));
            }
        }
    }

    let header = Message::from_serialize(
        FT_SEND_FILES_HEADER,
        &FilesHeader {
            file_count: opened.len() as u32,
        },
    )?;
    FrameWriter::new(&mut *writer)
        .write_frame(&header)
        .await
        .map_err(|e| abort_batch(&report.transferred, e))?;

    for (path, filename, mut file, size) in opened {
        write_file(writer, &mut file, filename, size)
            .await
            .map_err(|e| abort_batch(&report.transferred, e))?;
        debug!("Sent {:?} as {:?}", path, filename);
        report.transferred.push(path.clone());
    }
    info!(
        "Sent {} files ({} skipped)",
        report.transferred.len(),
        report.failed.len()
    );
    Ok(report)
}

/// 接收多个文件
///
/// 无法保存的文件会被读掉并记入 `failed`，不影响后续文件。
pub async fn recv_files<R>(reader: R, dir: &Path) -> Result<BatchReport>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    let header = frames
        .read_frame()
        .await
        .map_err(|e| abort_batch(&[], e))?;
    if header.opcode() != FT_SEND_FILES_HEADER {
        return Err(Error::UnexpectedOpcode {
            expected: FT_SEND_FILES_HEADER,
            actual: header.opcode(),
        });
    }
    let FilesHeader { file_count } = header.parse()?;

    // FrameReader 不会越过帧边界读取，剩余字节都属于文件帧
    let mut reader = BufReader::new(frames.into_inner());
    let mut report = BatchReport::default();
    for index in 0..file_count {
        let received = receive_one(&mut reader, dir)
            .await
            .map_err(|e| abort_batch(&report.transferred, e))?;
        match received {
            Some(Received::Saved(path)) => {
                debug!("Received {:?}", path);
                report.transferred.push(path);
            }
            Some(Received::Skipped { filename, reason }) => {
                warn!("Discarded file {:?}: {}", filename, reason);
                report
                    .failed
                    .push((PathBuf::from(filename), reason.to_string()));
            }
            None => {
                return Err(abort_batch(
                    &report.transferred,
                    Error::Connection(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("peer sent {} of {} files", index, file_count),
                    )),
                ))
            }
        }
    }
    info!(
        "Received {} files ({} discarded)",
        report.transferred.len(),
        report.failed.len()
    );
    Ok(report)
}

/// 监听方握手: 打开临时端口，经 `announce` 告知对端，等待其连入
///
/// 临时监听套接字在返回前关闭。套接字错误只影响本次传输，
/// 以 `TransferIncomplete` 返回；`announce` 的错误原样返回。
pub(crate) async fn accept_transfer<F>(local_ip: IpAddr, wait: Duration, announce: F) -> Result<TcpStream>
where
    F: FnOnce(&Message) -> Result<()>,
{
    let listener = tokio::net::TcpListener::bind((local_ip, 0))
        .await
        .map_err(handshake_failed)?;
    let port = listener.local_addr().map_err(handshake_failed)?.port();
    announce(&Message::from_serialize(
        FT_TRANSFER_PORT,
        &TransferPort { port },
    )?)?;
    debug!("Waiting for transfer connection on port {}", port);

    let (stream, peer) = timeout(wait, listener.accept())
        .await
        .map_err(|_| Error::TransferTimeout(wait))?
        .map_err(handshake_failed)?;
    debug!("Transfer connection from {}", peer);
    Ok(stream)
}

/// 连接方握手: 连接对端宣布的传输端口
pub(crate) async fn dial_transfer(ip: IpAddr, port: u16, wait: Duration) -> Result<TcpStream> {
    let stream = timeout(wait, TcpStream::connect((ip, port)))
        .await
        .map_err(|_| Error::TransferTimeout(wait))?
        .map_err(handshake_failed)?;
    debug!("Transfer connection to {}:{}", ip, port);
    Ok(stream)
}

/// 传输端口汇合点
///
/// 接收任务收到 `FT_TRANSFER_PORT` 后调用 `offer`，发起传输的一方调用 `wait`。
/// 只有正在等待的一方能拿到端口；没有等待者时到达的端口属于已放弃或
/// 未被请求的握手，直接丢弃，不会留给下一次传输。
#[derive(Debug, Default)]
pub(crate) struct PortRendezvous {
    waiter: Mutex<Option<oneshot::Sender<u16>>>,
}

impl PortRendezvous {
    pub(crate) async fn offer(&self, port: u16) {
        match self.waiter.lock().await.take() {
            Some(tx) => {
                if tx.send(port).is_err() {
                    warn!("Dropping transfer port {}: the wait already gave up", port);
                }
            }
            None => warn!("Dropping transfer port {}: no transfer is waiting", port),
        }
    }

    pub(crate) async fn wait(&self, limit: Duration) -> Result<u16> {
        let (tx, rx) = oneshot::channel();
        // 新的等待取代旧的，旧等待随之以 Closed 结束
        *self.waiter.lock().await = Some(tx);

        match timeout(limit, rx).await {
            Ok(Ok(port)) => Ok(port),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                let mut waiter = self.waiter.lock().await;
                // 接收端已随超时释放；较新的等待不受影响
                if waiter.as_ref().is_some_and(|tx| tx.is_closed()) {
                    *waiter = None;
                }
                Err(Error::TransferTimeout(limit))
            }
        }
    }

    /// 放弃正在进行的等待
    pub(crate) async fn close(&self) {
        *self.waiter.lock().await = None;
    }
}

fn handshake_failed(source: io::Error) -> Error {
    incomplete_bytes(0, source)
}

/// 批量传输的握手失败以文件数表示进度
pub(crate) fn batch_handshake(err: Error) -> Error {
    match err {
        Error::TransferIncomplete {
            completed: Progress::Bytes(0),
            source,
        } => Error::TransferIncomplete {
            completed: Progress::Files(Vec::new()),
            source,
        },
        other => other,
    }
}

fn incomplete_bytes(done: u64, source: io::Error) -> Error {
    Error::TransferIncomplete {
        completed: Progress::Bytes(done),
        source,
    }
}

/// 将批量传输中的 IO 错误统一转为 `TransferIncomplete`，附带已完成的文件
fn abort_batch(done: &[PathBuf], err: Error) -> Error {
    let source = match err {
        Error::Connection(source) | Error::TransferIncomplete { source, .. } => source,
        Error::EmptyFrame => io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"),
        other => return other,
    };
    Error::TransferIncomplete {
        completed: Progress::Files(done.to_vec()),
        source,
    }
}
