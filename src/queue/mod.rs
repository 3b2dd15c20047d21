//! 单一所有者的请求队列。
//!
//! 一个后台任务独占某个后端（数据库连接、Redis 连接、HTTP 客户端……），
//! 其他任务通过信道把请求发给它。后台任务按顺序处理请求，每个请求都调用一次后端，
//! 需要回复的请求通过`oneshot`信道拿到结果。

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, warn};

pub mod http;
pub mod mysql;
pub mod redis;

/// 请求信道的默认容量。
pub const DEFAULT_CHANNEL_SIZE: usize = 128;

/// 队列背后的后端。
///
/// `call()`一次只会被一个任务调用，后端不需要自己加锁。
pub trait Backend: Send + 'static {
    type Request: Send + 'static;
    type Reply: Send + 'static;

    fn call(
        &mut self,
        request: Self::Request,
    ) -> impl Future<Output = crate::Result<Self::Reply>> + Send;
}

/// 提交请求时可能出现的错误。
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// 队列已经关闭，请求没有被接收。
    #[error("队列已关闭")]
    Closed,

    /// 请求已经被接收，但后台任务没有回复就退出了。
    #[error("请求被丢弃")]
    Dropped,

    #[error("等待回复超时")]
    Timeout,

    #[error("后端出错：{0}")]
    Backend(crate::Error),

    #[error("后端发生 panic：{0}")]
    Panicked(String),
}

/// 发给后台任务的请求，`reply`为`None`表示不需要回复。
struct Envelope<B: Backend> {
    request: B::Request,
    reply: Option<oneshot::Sender<Result<B::Reply, QueueError>>>,
}

/// 请求队列的句柄，可以随意克隆。
pub struct Queue<B: Backend> {
    shared: Arc<Shared<B>>,
}

struct Shared<B: Backend> {
    tx: mpsc::Sender<Envelope<B>>,

    // 为`true`后不再接收新的请求。
    closed: AtomicBool,

    close_tx: watch::Sender<bool>,

    // 后台任务，`quit()`时等待它退出。
    owner: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> Clone for Queue<B> {
    fn clone(&self) -> Self {
        Queue {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> Queue<B> {
    /// 创建队列并启动后台任务，必须在 tokio 运行时内调用。
    pub fn new(backend: B, channel_size: usize) -> Queue<B> {
        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let (close_tx, close_rx) = watch::channel(false);

        let owner = tokio::spawn(run(backend, rx, close_rx));

        Queue {
            shared: Arc::new(Shared {
                tx,
                closed: AtomicBool::new(false),
                close_tx,
                owner: Mutex::new(Some(owner)),
            }),
        }
    }

    /// 提交请求并等待回复。
    pub async fn submit(&self, request: B::Request) -> Result<B::Reply, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Envelope {
            request,
            reply: Some(reply_tx),
        })
        .await?;

        match reply_rx.await {
            Ok(res) => res,
            Err(_) => Err(QueueError::Dropped),
        }
    }

    /// 提交请求，不等待回复。
    ///
    /// 请求进入信道后立即返回，信道满时会等待空位。
    pub async fn submit_lazy(&self, request: B::Request) -> Result<(), QueueError> {
        self.enqueue(Envelope {
            request,
            reply: None,
        })
        .await
    }

    /// 提交请求并最多等待`timeout`。
    ///
    /// 超时后请求仍然可能被执行。
    pub async fn submit_timeout(
        &self,
        request: B::Request,
        timeout: Duration,
    ) -> Result<B::Reply, QueueError> {
        match time::timeout(timeout, self.submit(request)).await {
            Ok(res) => res,
            Err(_) => Err(QueueError::Timeout),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// 信道中还没有被处理的请求数。
    pub fn pending(&self) -> usize {
        self.shared.tx.max_capacity() - self.shared.tx.capacity()
    }

    /// 关闭队列。
    ///
    /// 之后提交的请求都返回`QueueError::Closed`；已经进入信道的请求会被处理完，
    /// 然后后台任务退出。可以重复调用。
    pub async fn quit(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.close_tx.send_replace(true);

        let owner = self.shared.owner.lock().unwrap().take();
        if let Some(owner) = owner {
            if let Err(err) = owner.await {
                error!(%err, "队列后台任务异常退出");
            }
        }
    }

    async fn enqueue(&self, envelope: Envelope<B>) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.shared
            .tx
            .send(envelope)
            .await
            .map_err(|_| QueueError::Closed)
    }
}

impl<B: Backend> fmt::Debug for Queue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 后台任务：依次处理请求，收到关闭信号后处理完剩下的请求再退出。
async fn run<B: Backend>(
    mut backend: B,
    mut rx: mpsc::Receiver<Envelope<B>>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut closing = false;
    loop {
        let envelope = if closing {
            match rx.recv().await {
                Some(envelope) => envelope,
                None => break,
            }
        } else {
            tokio::select! {
                maybe_envelope = rx.recv() => match maybe_envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
                // 关闭信号只会从`false`变为`true`，发送端被丢弃同样视为关闭。
                _ = close_rx.changed() => {
                    rx.close();
                    closing = true;
                    continue;
                }
            }
        };

        process(&mut backend, envelope).await;
    }

    debug!("队列后台任务已退出");
}

/// 调用一次后端，回复一次。
async fn process<B: Backend>(backend: &mut B, envelope: Envelope<B>) {
    let Envelope { request, reply } = envelope;

    let res = match AssertUnwindSafe(backend.call(request)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            warn!(%err, "后端处理请求失败");
            Err(QueueError::Backend(err))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(%message, "后端处理请求时发生 panic");
            Err(QueueError::Panicked(message))
        }
    };

    // 请求方可能已经不再等待。
    if let Some(reply) = reply {
        let _ = reply.send(res);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 把请求加到累计值上并返回；请求为负数时返回错误，为`0`时 panic。
    struct Sum {
        total: i64,
    }

    impl Backend for Sum {
        type Request = i64;
        type Reply = i64;

        async fn call(&mut self, request: i64) -> crate::Result<i64> {
            if request < 0 {
                return Err("negative".into());
            }
            if request == 0 {
                panic!("zero");
            }
            self.total += request;
            Ok(self.total)
        }
    }

    #[tokio::test]
    async fn replies_in_order() {
        let queue = Queue::new(Sum { total: 0 }, 4);
        assert_eq!(queue.submit(1).await.unwrap(), 1);
        assert_eq!(queue.submit(2).await.unwrap(), 3);
        queue.submit_lazy(10).await.unwrap();
        assert_eq!(queue.submit(1).await.unwrap(), 14);
    }

    #[tokio::test]
    async fn errors_and_panics_get_one_reply() {
        let queue = Queue::new(Sum { total: 0 }, 4);

        assert!(matches!(queue.submit(-1).await, Err(QueueError::Backend(_))));
        match queue.submit(0).await {
            Err(QueueError::Panicked(message)) => assert_eq!(message, "zero"),
            other => panic!("unexpected {other:?}"),
        }

        // 后台任务还在运行。
        assert_eq!(queue.submit(5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn quit_drains_then_rejects() {
        let queue = Queue::new(Sum { total: 0 }, 8);
        for _ in 0..5 {
            queue.submit_lazy(1).await.unwrap();
        }
        queue.quit().await;

        assert!(queue.is_closed());
        assert!(matches!(queue.submit(1).await, Err(QueueError::Closed)));
        assert!(matches!(queue.submit_lazy(1).await, Err(QueueError::Closed)));

        // 再次关闭不会出错。
        queue.quit().await;
    }

    #[test]
    fn panic_messages() {
        let message: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(message.as_ref()), "boom");
        let message: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(message.as_ref()), "bang");
        let message: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(message.as_ref()), "unknown panic");
    }
}
