//! 数据包服务器的实现。
//!
//! 提供了异步的`run()`函数来监听到来的连接，并把每个连接交给`Clients`。

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    time,
};
use tracing::{error, info, instrument, warn};

use crate::{clients::Clients, config::ServerConfig, handler::Handler};

/// Server Listener，包装了`tokio::net::TcpListener`，
/// 在`server::run()`方法内被创建。
///
/// 负责 Tcp 侦听以及把连接交给连接表。
#[derive(Debug)]
struct Listener<H> {
    // `tokio::net::TcpListener`，由`run()`方法提供。
    listener: TcpListener,

    // 连接表。
    clients: Clients<H>,

    // 信号量，用于限制最大连接数。
    limit_connection: Arc<Semaphore>,
}

/// 启动服务器。
///
/// 同时运行`Listener`和`shutdown`，后者完成时关闭所有连接并返回。
///
/// 可以使用`tokio::signal::ctrl_c()`作为`shutdown`参数。
pub async fn run<H: Handler>(
    listener: TcpListener,
    clients: Clients<H>,
    config: &ServerConfig,
    shutdown: impl Future,
) {
    let mut server = Listener {
        listener,
        clients,
        limit_connection: Arc::new(Semaphore::new(config.max_connections.max(1))),
    };

    // server 只有在出现错误的时候才会结束，因此通常情况下会一直运行，
    // 直到 shutdown 这个`Future`完成。
    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(%err, "接收连接失败");
            }
        }
        _ = shutdown => {
            info!("接收到关闭信号，准备关闭");
        }
    }

    // 关闭所有连接，等待它们退出。
    server.clients.quit().await;
    info!("服务器已关闭");
}

impl<H: Handler> Listener<H> {
    /// 侦听到达的连接，每个连接都交给连接表。
    ///
    /// # Errors
    ///
    /// 当接收连接产生错误时，返回`Err`。
    #[instrument(skip(self))]
    async fn run(&mut self) -> crate::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "开始接收连接");
        loop {
            // `acquire_owned()`返回一个 permit，当它被 drop 的时候信号量会自动递增。
            // 信号量不会被关闭，这里的错误也就不会出现。
            let permit = self.limit_connection.clone().acquire_owned().await?;

            let socket = self.accept().await?;

            let id = match self.clients.add_connection(socket) {
                Ok(id) => id,
                Err(err) => {
                    warn!(%err, "无法接管连接");
                    continue;
                }
            };

            // 连接退出后才归还 permit。
            if let Some(worker) = self.clients.worker(id) {
                tokio::spawn(async move {
                    worker.closed().await;
                    drop(permit);
                });
            }
        }
    }

    /// 接收一个到来的连接，并尝试处理错误。
    ///
    /// 使用指数退避策略。第一次失败后，任务将等待1秒。
    /// 第二次失败后，任务将等待2秒钟。每次失败都会使后续的等待时间翻倍。
    ///
    /// # Errors
    ///
    /// 如果在等待64秒后第6次尝试时仍接收失败，返回`Err`。
    async fn accept(&mut self) -> crate::Result<TcpStream> {
        let mut backoff = 1;
        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                    warn!(%err, backoff, "接收连接失败，稍后重试");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;

            backoff *= 2;
        }
    }
}
