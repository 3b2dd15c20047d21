use std::io::{Error, ErrorKind};

use async_stream::try_stream;
use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_stream::Stream;

use crate::Connection;

/// 负责与服务器建立连接，收发数据包。
#[derive(Debug)]
pub struct Client {
    connection: Connection,
}

impl Client {
    /// 与服务器建立连接，创建`Client`。
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> crate::Result<Client> {
        let socket = TcpStream::connect(addr).await?;
        let connection = Connection::new(socket);
        Ok(Client { connection })
    }

    /// 发送一个数据包，不等待响应。
    ///
    /// # Errors
    /// 数据体过长或写入失败时返回`Err`。
    pub async fn send(&mut self, body: impl AsRef<[u8]>) -> crate::Result<()> {
        self.connection.write_packet(body.as_ref()).await?;
        Ok(())
    }

    /// 发送一个保活包。
    pub async fn keep_alive(&mut self) -> crate::Result<()> {
        self.connection.write_keep_alive().await?;
        Ok(())
    }

    /// 用`LOGIN <session-id>`登录。
    ///
    /// # Output
    /// 返回服务器的回复，登录成功时为`OK <session-id>`。
    pub async fn login(&mut self, session_id: i64) -> crate::Result<Bytes> {
        self.request(format!("LOGIN {session_id}")).await
    }

    /// 发送一个数据包并等待一个响应包。
    pub async fn request(&mut self, body: impl AsRef<[u8]>) -> crate::Result<Bytes> {
        self.send(body).await?;
        self.read_response().await
    }

    /// 读取一个数据包。
    ///
    /// # Output
    /// 服务器正常关闭连接时返回`Ok(None)`。
    pub async fn read_packet(&mut self) -> crate::Result<Option<Bytes>> {
        Ok(self.connection.read_packet().await?)
    }

    /// 把`Client`转换为数据包的流，服务器关闭连接时流结束。
    pub fn packets(mut self) -> impl Stream<Item = crate::Result<Bytes>> {
        try_stream! {
            while let Some(body) = self.read_packet().await? {
                yield body;
            }
        }
    }

    /// 读取响应包。
    ///
    /// # Output
    /// 服务器关闭了连接时返回`Err`。
    async fn read_response(&mut self) -> crate::Result<Bytes> {
        match self.connection.read_packet().await? {
            Some(body) => Ok(body),
            None => {
                let err = Error::new(ErrorKind::ConnectionReset, "服务器关闭了连接");
                Err(err.into())
            }
        }
    }
}
