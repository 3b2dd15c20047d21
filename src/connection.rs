use std::{io, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time,
};

use crate::packet::{self, PacketError, HEADER_SIZE};

/// 默认的读缓存大小，数据体按这个大小分块读取。
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// 默认的数据包读取时限：包头的第一个字节到达后，整个包必须在这段时间内读完。
pub const DEFAULT_BODY_TIMEOUT: Duration = Duration::from_secs(5);

/// 默认的写时限。
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// 读取数据包时可能出现的错误。
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// 包头不合法。
    #[error("协议错误：{0}")]
    Protocol(#[from] PacketError),

    /// 读到的数据体比包头声明的短，连接必须关闭，不做重新同步。
    #[error("数据包不完整：期望 {expected} 字节，只读到 {read} 字节")]
    ShortBody { expected: usize, read: usize },

    /// 等待下一个包头时出现的 I/O 错误。
    #[error("I/O 错误：{0}")]
    Io(#[from] io::Error),
}

/// 写数据包时可能出现的错误。
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// 数据体无法编码，只丢弃这一个包。
    #[error("无法编码：{0}")]
    Packet(#[from] PacketError),

    /// 写超时。
    #[error("写超时")]
    Timeout,

    #[error("I/O 错误：{0}")]
    Io(#[from] io::Error),
}

impl ReadError {
    /// 这个错误是否应该让连接关闭。
    pub fn is_fatal(&self) -> bool {
        match self {
            ReadError::Io(err) => is_fatal(err),
            _ => true,
        }
    }
}

impl WriteError {
    /// 这个错误是否应该让连接关闭。
    ///
    /// 写超时也是致命的：半个数据包可能已经写进了 socket，对方无法再对齐。
    pub fn is_fatal(&self) -> bool {
        match self {
            WriteError::Packet(_) => false,
            WriteError::Timeout => true,
            WriteError::Io(err) => is_fatal(err),
        }
    }
}

/// 判断一个 I/O 错误是否致命。
///
/// 超时、中断这类暂时性的错误返回`false`，调用方记录日志后继续循环；
/// 其他错误（EOF、断开的管道、连接重置、已关闭的连接……）都返回`true`。
/// 所有“这个连接该不该死”的判断都集中在这里。
pub fn is_fatal(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// 从字节流中读取数据包。
///
/// 持有一个固定大小的读缓存和一个可复用的数据体缓存。
#[derive(Debug)]
pub struct PacketReader<R> {
    stream: R,

    // 固定大小的读缓存，数据体按它的大小分块读取。
    buffer: Vec<u8>,

    // 拼接数据体用的缓存。
    body: BytesMut,

    body_timeout: Duration,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(stream: R, buffer_size: usize, body_timeout: Duration) -> PacketReader<R> {
        PacketReader {
            stream,
            buffer: vec![0; buffer_size.max(1)],
            body: BytesMut::new(),
            body_timeout,
        }
    }

    /// 读取一个完整的数据包，返回数据体。
    ///
    /// 等待包头的第一个字节时没有时限；第一个字节到达后，包头和数据体都要在
    /// `body_timeout`内读完，否则视为协议错误。
    ///
    /// # Output
    /// 成功读到数据包返回`Ok(Some(body))`，总长度为 6 的空包返回空的`body`；
    /// 对方在包与包之间正常关闭返回`Ok(None)`；
    /// 包读到一半连接断开或超时返回`Err`。
    pub async fn read_packet(&mut self) -> Result<Option<Bytes>, ReadError> {
        let mut header = [0u8; HEADER_SIZE];

        let read = self.stream.read(&mut header).await?;
        if read == 0 {
            return Ok(None);
        }

        if read < HEADER_SIZE {
            let rest = self.stream.read_exact(&mut header[read..]);
            match time::timeout(self.body_timeout, rest).await {
                Ok(Ok(_)) => {}
                // 包头只读到一半，不管是什么原因都无法继续。
                Ok(Err(_)) | Err(_) => return Err(PacketError::ShortHeader(read).into()),
            }
        }

        let body_size = packet::check_header(&header)?;
        if body_size == 0 {
            return Ok(Some(Bytes::new()));
        }

        let body_timeout = self.body_timeout;
        match time::timeout(body_timeout, self.read_body(body_size)).await {
            Ok(res) => res.map(Some),
            Err(_) => Err(ReadError::ShortBody {
                expected: body_size,
                read: self.body.len(),
            }),
        }
    }

    /// 按读缓存大小分块读取数据体，直到读满`body_size`字节。
    async fn read_body(&mut self, body_size: usize) -> Result<Bytes, ReadError> {
        self.body.clear();
        self.body.reserve(body_size);

        while self.body.len() < body_size {
            let left = body_size - self.body.len();
            let chunk = left.min(self.buffer.len());

            let read = match self.stream.read(&mut self.buffer[..chunk]).await {
                Ok(read) => read,
                // 暂时性的错误，重试，总时长由外层的超时限制。
                Err(err) if !is_fatal(&err) => continue,
                Err(_) => 0,
            };
            if read == 0 {
                return Err(ReadError::ShortBody {
                    expected: body_size,
                    read: self.body.len(),
                });
            }
            self.body.put_slice(&self.buffer[..read]);
        }

        Ok(self.body.split().freeze())
    }
}

/// 向字节流中写入数据包。
#[derive(Debug)]
pub struct PacketWriter<W: AsyncWrite> {
    // 用`BufWriter`包装，包头和数据体合并为一次系统调用。
    stream: BufWriter<W>,

    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(stream: W, write_timeout: Duration) -> PacketWriter<W> {
        PacketWriter {
            stream: BufWriter::new(stream),
            write_timeout,
        }
    }

    /// 将数据体编码为数据包并写入，带写时限。
    ///
    /// 空的数据体什么都不写。
    pub async fn write_packet(&mut self, body: &[u8]) -> Result<(), WriteError> {
        let packet = packet::encode(body)?;
        if packet.is_empty() {
            return Ok(());
        }

        let write = async {
            self.stream.write_all(&packet).await?;
            // 上面只是写入了缓存，这里确保数据进入 socket。
            self.stream.flush().await
        };
        match time::timeout(self.write_timeout, write).await {
            Ok(res) => res.map_err(WriteError::from),
            Err(_) => Err(WriteError::Timeout),
        }
    }

    /// 写入一个只有包头的保活包。
    pub async fn write_keep_alive(&mut self) -> Result<(), WriteError> {
        let header = packet::keep_alive();
        let write = async {
            self.stream.write_all(&header).await?;
            self.stream.flush().await
        };
        match time::timeout(self.write_timeout, write).await {
            Ok(res) => res.map_err(WriteError::from),
            Err(_) => Err(WriteError::Timeout),
        }
    }

    /// 关闭写方向。
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// 发送和接收数据包。
///
/// 客户端使用它：读写都在同一个任务里进行。服务端的每个连接由`worker`
/// 拆分成读循环和写循环，分别持有`PacketReader`和`PacketWriter`。
#[derive(Debug)]
pub struct Connection {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
}

impl Connection {
    /// 创建一个`Connection`，同时初始化缓存。
    pub fn new(socket: TcpStream) -> Connection {
        let (read_half, write_half) = socket.into_split();
        Connection {
            reader: PacketReader::new(read_half, DEFAULT_READ_BUFFER_SIZE, DEFAULT_BODY_TIMEOUT),
            writer: PacketWriter::new(write_half, DEFAULT_WRITE_TIMEOUT),
        }
    }

    /// 从连接中读取一个完整的数据包。
    pub async fn read_packet(&mut self) -> Result<Option<Bytes>, ReadError> {
        self.reader.read_packet().await
    }

    /// 向连接中写入一个数据包。
    pub async fn write_packet(&mut self, body: &[u8]) -> Result<(), WriteError> {
        self.writer.write_packet(body).await
    }

    /// 向连接中写入一个保活包。
    pub async fn write_keep_alive(&mut self) -> Result<(), WriteError> {
        self.writer.write_keep_alive().await
    }
}
