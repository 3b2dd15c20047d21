//! 单个连接的工作单元。
//!
//! 每个连接由两个任务组成：读循环负责读取数据包并调用`Handler`，写循环负责
//! 把`cast()`进来的数据写回 socket。任何一个循环结束都会通知另一个循环退出，
//! 两个循环都结束后调用一次`Handler::quit()`，再把自己从连接表中移除。

use std::{
    fmt,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    config::WorkerConfig,
    connection::{PacketReader, PacketWriter},
    handler::Handler,
    packet::{Packet, MAX_BODY_SIZE},
    Shutdown,
};

/// 连接的操作句柄。
///
/// 可以随意克隆，所有克隆都指向同一个连接。连接结束后句柄仍然可用，
/// 只是`cast()`等操作都会返回`false`。
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

struct Shared {
    id: u32,

    peer_addr: Option<SocketAddr>,

    // 下发信道，只有写循环在接收。
    cast_tx: mpsc::Sender<Bytes>,

    // 关闭信号，两个循环都订阅了它。
    close_tx: watch::Sender<bool>,

    // 两个循环都结束、`quit`回调也执行完后变为`true`。
    done_tx: watch::Sender<bool>,

    // 锁内不会有异步操作，使用`std::sync::Mutex`即可。
    state: Mutex<State>,

    quit_wait: Duration,
}

#[derive(Debug)]
struct State {
    // `0`表示还没有登录。
    session_id: i64,

    last_active: Instant,
}

impl WorkerHandle {
    /// 连接 id。
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// 对方的地址，不是 TCP 连接时为`None`。
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// 已绑定的会话 id，未登录时为`0`。
    pub fn session_id(&self) -> i64 {
        self.shared.state.lock().unwrap().session_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_id() > 0
    }

    /// 是否已经发出了关闭信号。
    pub fn is_closed(&self) -> bool {
        *self.shared.close_tx.borrow()
    }

    /// 距离上一次收到数据包过去了多久。
    pub fn idle_for(&self) -> Duration {
        let last_active = self.shared.state.lock().unwrap().last_active;
        Instant::now().saturating_duration_since(last_active)
    }

    /// 向连接发送一个数据体，不会等待。
    ///
    /// # Output
    /// 数据体为空或过长、下发信道已满、连接已关闭时返回`false`，数据被丢弃。
    pub fn cast(&self, body: impl Into<Bytes>) -> bool {
        let body = body.into();
        if body.is_empty() || body.len() > MAX_BODY_SIZE || self.is_closed() {
            return false;
        }

        match self.shared.cast_tx.try_send(body) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = self.id(), "下发信道已满，丢弃数据");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// 绑定会话 id，`session_id`小于等于`0`时返回`false`。
    pub fn bind_session(&self, session_id: i64) -> bool {
        if session_id <= 0 {
            return false;
        }
        self.shared.state.lock().unwrap().session_id = session_id;
        true
    }

    /// 发出关闭信号，不等待连接退出。可以重复调用。
    pub fn close(&self) {
        self.shared.close_tx.send_replace(true);
    }

    /// 发出关闭信号，并等待连接退出一小段时间。
    ///
    /// # Output
    /// 在等待时间内连接已经完全退出时返回`true`。
    pub async fn quit(&self) -> bool {
        self.close();
        time::timeout(self.shared.quit_wait, self.closed())
            .await
            .is_ok()
    }

    /// 等待连接完全退出。
    pub async fn closed(&self) {
        let mut done = self.shared.done_tx.subscribe();
        // 发送端由`Shared`持有，不会先于句柄被丢弃。
        let _ = done.wait_for(|done| *done).await;
    }

    /// 刷新最后活跃时间。
    pub(crate) fn touch(&self) {
        self.shared.state.lock().unwrap().last_active = Instant::now();
    }

    /// 两个句柄是否指向同一个连接。
    pub(crate) fn same_worker(&self, other: &WorkerHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .field("session_id", &self.session_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 启动一个连接，返回它的句柄。
///
/// `on_exit`在两个循环都结束、`Handler::quit()`执行完以后调用；
/// `shutdown_complete`在连接完全退出时被丢弃，用来等待所有连接退出。
pub(crate) fn spawn<H, S, F>(
    id: u32,
    stream: S,
    peer_addr: Option<SocketAddr>,
    handler: Arc<H>,
    config: &WorkerConfig,
    on_exit: F,
    shutdown_complete: Option<mpsc::Sender<()>>,
) -> WorkerHandle
where
    H: Handler,
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: FnOnce(&WorkerHandle) + Send + 'static,
{
    let (cast_tx, cast_rx) = mpsc::channel(config.cast_channel_size.max(1));
    let (close_tx, close_rx) = watch::channel(false);
    let (done_tx, _) = watch::channel(false);

    let handle = WorkerHandle {
        shared: Arc::new(Shared {
            id,
            peer_addr,
            cast_tx,
            close_tx,
            done_tx,
            state: Mutex::new(State {
                session_id: 0,
                last_active: Instant::now(),
            }),
            quit_wait: config.quit_wait(),
        }),
    };

    let (read_half, write_half) = tokio::io::split(stream);

    let mut reader = ReadLoop {
        handle: handle.clone(),
        handler: handler.clone(),
        reader: PacketReader::new(read_half, config.read_buffer_size, config.body_timeout()),
        shutdown: Shutdown::new(close_rx.clone()),
        login_max_try_times: config.login_max_try_times.max(1),
        login_tries: 0,
    };

    let writer = WriteLoop {
        handle: handle.clone(),
        writer: PacketWriter::new(write_half, config.write_timeout()),
        cast_rx,
        shutdown: Shutdown::new(close_rx),
        tick: config.tick(),
        write_timeout: config.write_timeout(),
    };

    let worker = handle.clone();
    let span = info_span!("worker", connection_id = id);
    tokio::spawn(
        async move {
            // 离开作用域时被丢弃，表示这个连接已经退出。
            let _shutdown_complete = shutdown_complete;

            debug!(peer = ?worker.peer_addr(), "连接开始");
            let write_task = tokio::spawn(writer.run().in_current_span());

            if AssertUnwindSafe(reader.run()).catch_unwind().await.is_err() {
                error!("读循环发生 panic");
            }
            drop(reader);

            // 读循环结束，通知写循环退出。
            worker.close();
            if let Err(err) = write_task.await {
                error!(%err, "写循环异常退出");
            }

            let session_id = worker.session_id();
            let quit = handler.quit(worker.id(), session_id);
            if AssertUnwindSafe(quit).catch_unwind().await.is_err() {
                error!("quit 回调发生 panic");
            }

            on_exit(&worker);
            worker.shared.done_tx.send_replace(true);
            debug!(session_id, "连接结束");
        }
        .instrument(span),
    );

    handle
}

/// 读循环。
struct ReadLoop<H, R> {
    handle: WorkerHandle,
    handler: Arc<H>,
    reader: PacketReader<R>,
    shutdown: Shutdown,
    login_max_try_times: u32,

    // 连续登录失败的次数。
    login_tries: u32,
}

impl<H, R> ReadLoop<H, R>
where
    H: Handler,
    R: AsyncRead + Unpin,
{
    async fn run(&mut self) {
        while !self.shutdown.is_shutdown() {
            let res = tokio::select! {
                biased;
                _ = self.shutdown.recv() => return,
                res = self.reader.read_packet() => res,
            };

            let body = match res {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!("对方关闭了连接");
                    return;
                }
                Err(err) if !err.is_fatal() => {
                    warn!(%err, "读取出错，继续等待");
                    continue;
                }
                Err(err) => {
                    warn!(%err, "读取出错，关闭连接");
                    return;
                }
            };

            self.handle.touch();

            // 空包只用来保活。
            if body.is_empty() {
                trace!("收到心跳包");
                continue;
            }

            if !self.handle.is_authenticated() {
                if !self.login(body).await {
                    return;
                }
                continue;
            }

            let packet = Packet {
                connection_id: self.handle.id(),
                session_id: self.handle.session_id(),
                body,
            };
            self.handler.request(self.handle.clone(), packet).await;
        }
    }

    /// 处理一个登录包，返回`false`表示失败次数已达上限，连接应该关闭。
    async fn login(&mut self, body: Bytes) -> bool {
        let session_id = self.handler.login(self.handle.clone(), body).await;
        if self.handle.bind_session(session_id) {
            info!(session_id, "登录成功");
            self.login_tries = 0;
            return true;
        }

        self.login_tries += 1;
        if self.login_tries >= self.login_max_try_times {
            warn!(tries = self.login_tries, "登录失败次数过多，关闭连接");
            return false;
        }
        debug!(tries = self.login_tries, "登录失败");
        true
    }
}

/// 写循环，是唯一向 socket 写数据的地方。
struct WriteLoop<W: AsyncWrite> {
    handle: WorkerHandle,
    writer: PacketWriter<W>,
    cast_rx: mpsc::Receiver<Bytes>,
    shutdown: Shutdown,
    tick: Duration,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> WriteLoop<W> {
    async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                // 收到关闭信号立即退出，信道里剩下的数据不再发送。
                _ = self.shutdown.recv() => break,
                maybe_body = self.cast_rx.recv() => {
                    let Some(body) = maybe_body else { break };
                    if let Err(err) = self.writer.write_packet(&body).await {
                        if err.is_fatal() {
                            warn!(%err, "写入出错，关闭连接");
                            self.handle.close();
                            break;
                        }
                        warn!(%err, "写入出错，丢弃数据");
                    }
                }
                _ = ticker.tick() => {
                    trace!(idle = ?self.handle.idle_for(), "心跳检查");
                }
            }
        }

        // 之后的`cast()`都会失败。
        self.cast_rx.close();
        let _ = time::timeout(self.write_timeout, self.writer.shutdown()).await;
    }
}
