use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, Notify},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ClientsConfig, WorkerConfig},
    handler::Handler,
    worker::{self, WorkerHandle},
};

/// 连接表，记录所有存活的连接。
///
/// 可以随意克隆，所有克隆共享同一个连接表。连接表会运行一个后台任务，
/// 定期关闭空闲太久的连接；调用`quit()`后后台任务退出。
pub struct Clients<H> {
    shared: Arc<Shared<H>>,
}

struct Shared<H> {
    // 锁内没有异步操作，关键部分也很小，使用`std::sync::Mutex`。
    state: Mutex<State>,

    handler: Arc<H>,

    worker_config: WorkerConfig,

    config: ClientsConfig,

    // 通知清理任务退出，清理任务只持有它和`Shared`的弱引用。
    background_task: Arc<Notify>,

    // 所有发送端都被丢弃后返回`None`，表示所有连接都已退出。
    shutdown_complete_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

#[derive(Debug)]
struct State {
    workers: HashMap<u32, WorkerHandle>,

    // 上一次分配的 id。
    last_id: u32,

    // 为`true`时不再接受新连接，清理任务也会退出。
    shutdown: bool,

    // 每个连接持有一个克隆，`quit()`时丢弃这一个。
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
}

/// 添加连接时可能出现的错误。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientsError {
    #[error("连接表已关闭")]
    Closed,

    #[error("没有可用的连接 id")]
    Exhausted,
}

impl<H> Clone for Clients<H> {
    fn clone(&self) -> Self {
        Clients {
            shared: self.shared.clone(),
        }
    }
}

impl<H> fmt::Debug for Clients<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("Clients")
            .field("workers", &state.workers.len())
            .field("last_id", &state.last_id)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl<H: Handler> Clients<H> {
    /// 创建连接表，同时开启空闲连接的清理任务。
    ///
    /// # Panics
    ///
    /// 配置了`max_idle`时会`tokio::spawn`清理任务，必须在 tokio 运行时中调用。
    pub fn new(handler: H, worker_config: WorkerConfig, config: ClientsConfig) -> Clients<H> {
        Clients::with_shared_handler(Arc::new(handler), worker_config, config)
    }

    /// 与`new()`相同，但`Handler`已经被其他地方共享。
    ///
    /// # Panics
    ///
    /// 与`new()`相同，配置了`max_idle`时必须在 tokio 运行时中调用。
    pub fn with_shared_handler(
        handler: Arc<H>,
        worker_config: WorkerConfig,
        config: ClientsConfig,
    ) -> Clients<H> {
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                workers: HashMap::new(),
                last_id: 0,
                shutdown: false,
                shutdown_complete_tx: Some(shutdown_complete_tx),
            }),
            handler,
            worker_config,
            config,
            background_task: Arc::new(Notify::new()),
            shutdown_complete_rx: tokio::sync::Mutex::new(shutdown_complete_rx),
        });

        if let Some(max_idle) = shared.config.max_idle() {
            tokio::spawn(sweep_idle_workers(
                Arc::downgrade(&shared),
                shared.background_task.clone(),
                shared.config.sweep_interval(),
                max_idle,
            ));
        }

        Clients { shared }
    }

    /// 接管一个 TCP 连接，返回分配的连接 id。
    pub fn add_connection(&self, socket: TcpStream) -> Result<u32, ClientsError> {
        let peer_addr = socket.peer_addr().ok();
        self.add_stream(socket, peer_addr)
    }

    /// 接管任意字节流，返回分配的连接 id。
    pub fn add_stream<S>(&self, stream: S, peer_addr: Option<SocketAddr>) -> Result<u32, ClientsError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(ClientsError::Closed);
        }
        let id = state.next_id(self.shared.config.max_client_id)?;
        let shutdown_complete = state.shutdown_complete_tx.clone();

        // 连接退出时把自己从连接表中移除。
        let shared = Arc::downgrade(&self.shared);
        let on_exit = move |worker: &WorkerHandle| {
            if let Some(shared) = shared.upgrade() {
                shared.remove_if_same(worker);
            }
        };

        let handle = worker::spawn(
            id,
            stream,
            peer_addr,
            self.shared.handler.clone(),
            &self.shared.worker_config,
            on_exit,
            shutdown_complete,
        );
        state.workers.insert(id, handle);
        drop(state);

        debug!(connection_id = id, peer = ?peer_addr, "新连接");
        Ok(id)
    }

    /// 向指定连接发送数据，连接不存在或发送失败时返回`false`。
    pub fn cast_to(&self, id: u32, body: impl Into<Bytes>) -> bool {
        match self.worker(id) {
            Some(worker) => worker.cast(body),
            None => false,
        }
    }

    /// 关闭并移除指定连接，连接不存在时返回`false`。可以重复调用。
    pub async fn force_close(&self, id: u32) -> bool {
        let worker = self.shared.state.lock().unwrap().workers.remove(&id);
        match worker {
            Some(worker) => {
                // 在锁外等待，连接退出时也要获取这把锁。
                worker.quit().await;
                true
            }
            None => false,
        }
    }

    /// 为指定连接绑定会话 id。
    pub fn bind_session(&self, id: u32, session_id: i64) -> bool {
        match self.worker(id) {
            Some(worker) => worker.bind_session(session_id),
            None => false,
        }
    }

    /// 获取指定连接的句柄。
    pub fn worker(&self, id: u32) -> Option<WorkerHandle> {
        self.shared.state.lock().unwrap().workers.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有存活连接的 id，从小到大排列。
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .shared
            .state
            .lock()
            .unwrap()
            .workers
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// 关闭所有连接，最多等待`drain_timeout`。
    ///
    /// 之后添加连接都会返回`ClientsError::Closed`。
    pub async fn quit(&self) {
        let (workers, shutdown_complete_tx) = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            let workers: Vec<WorkerHandle> = state.workers.drain().map(|(_, w)| w).collect();
            (workers, state.shutdown_complete_tx.take())
        };
        self.shared.background_task.notify_one();

        info!(count = workers.len(), "关闭所有连接");
        for worker in &workers {
            worker.close();
        }
        drop(shutdown_complete_tx);

        let mut shutdown_complete_rx = self.shared.shutdown_complete_rx.lock().await;
        let drain = shutdown_complete_rx.recv();
        if time::timeout(self.shared.config.drain_timeout(), drain)
            .await
            .is_err()
        {
            warn!("等待连接退出超时");
        }
    }

    /// 检查一次空闲连接，关闭空闲太久的，返回关闭的个数。
    pub async fn sweep(&self) -> usize {
        let Some(max_idle) = self.shared.config.max_idle() else {
            return 0;
        };
        let idle = self.shared.take_idle(max_idle);
        for worker in &idle {
            info!(connection_id = worker.id(), idle = ?worker.idle_for(), "连接空闲太久，关闭");
            worker.quit().await;
        }
        idle.len()
    }
}

impl State {
    /// 分配下一个 id，到达上限后从`1`重新开始，跳过仍然存活的 id。
    fn next_id(&mut self, max_client_id: u32) -> Result<u32, ClientsError> {
        let max_client_id = max_client_id.max(1);
        if self.workers.len() >= max_client_id as usize {
            return Err(ClientsError::Exhausted);
        }
        loop {
            self.last_id = if self.last_id >= max_client_id {
                1
            } else {
                self.last_id + 1
            };
            if !self.workers.contains_key(&self.last_id) {
                return Ok(self.last_id);
            }
        }
    }
}

impl<H> Shared<H> {
    /// 只有连接表里记录的还是同一个连接时才移除，id 可能已经被重新分配。
    fn remove_if_same(&self, worker: &WorkerHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.workers.get(&worker.id()) {
            if current.same_worker(worker) {
                state.workers.remove(&worker.id());
            }
        }
    }

    /// 从连接表中取出所有空闲超过`max_idle`的连接。
    fn take_idle(&self, max_idle: Duration) -> Vec<WorkerHandle> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<u32> = state
            .workers
            .iter()
            .filter(|(_, worker)| worker.idle_for() > max_idle)
            .map(|(id, _)| *id)
            .collect();
        ids.iter()
            .filter_map(|id| state.workers.remove(id))
            .collect()
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }
}

// 连接表被丢弃时通知清理任务退出。
impl<H> Drop for Shared<H> {
    fn drop(&mut self) {
        self.background_task.notify_one();
    }
}

/// 后台任务，每隔`interval`关闭空闲超过`max_idle`的连接。
///
/// 连接表调用`quit()`或者被丢弃后退出。
async fn sweep_idle_workers<H: Handler>(
    shared: Weak<Shared<H>>,
    stop: Arc<Notify>,
    interval: Duration,
    max_idle: Duration,
) {
    loop {
        tokio::select! {
            _ = time::sleep(interval) => {}
            _ = stop.notified() => break,
        }

        // 只在检查期间持有强引用。
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.is_shutdown() {
            break;
        }
        for worker in shared.take_idle(max_idle) {
            info!(connection_id = worker.id(), idle = ?worker.idle_for(), "连接空闲太久，关闭");
            worker.close();
        }
    }

    debug!("空闲连接清理任务已退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use crate::packet::{self, Packet};

    /// 任何登录包都成功，记录`quit`被调用的次数。
    #[derive(Default)]
    struct Counter {
        quits: AtomicUsize,
    }

    impl Handler for Counter {
        async fn login(&self, _conn: WorkerHandle, _body: Bytes) -> i64 {
            1
        }

        async fn request(&self, _conn: WorkerHandle, _packet: Packet) {}

        async fn quit(&self, _connection_id: u32, _session_id: i64) {
            self.quits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn idle_config(max_idle_secs: Option<u64>) -> ClientsConfig {
        ClientsConfig {
            sweep_interval_secs: 1,
            max_idle_secs,
            ..ClientsConfig::default()
        }
    }

    async fn connect(clients: &Clients<Counter>) -> (u32, WorkerHandle, DuplexStream) {
        let (mut client, server) = tokio::io::duplex(1024);
        let id = clients.add_stream(server, None).unwrap();
        client.write_all(&packet::encode(b"hi").unwrap()).await.unwrap();
        let worker = clients.worker(id).unwrap();
        (id, worker, client)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_are_swept() {
        let handler = Arc::new(Counter::default());
        let clients =
            Clients::with_shared_handler(handler.clone(), WorkerConfig::default(), idle_config(Some(1)));
        let (id, worker, _client) = connect(&clients).await;

        time::sleep(Duration::from_millis(2500)).await;
        worker.closed().await;

        assert!(clients.is_empty());
        assert!(!clients.cast_to(id, "late"));
        assert_eq!(handler.quits.load(Ordering::SeqCst), 1);
        clients.quit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_disabled_without_max_idle() {
        let handler = Arc::new(Counter::default());
        let clients =
            Clients::with_shared_handler(handler.clone(), WorkerConfig::default(), idle_config(None));
        let (id, worker, _client) = connect(&clients).await;

        time::sleep(Duration::from_secs(600)).await;

        assert_eq!(clients.ids(), vec![id]);
        assert!(!worker.is_closed());
        assert_eq!(clients.sweep().await, 0);
        assert_eq!(handler.quits.load(Ordering::SeqCst), 0);
        clients.quit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_sweep_closes_idle_workers() {
        let handler = Arc::new(Counter::default());
        let config = ClientsConfig {
            sweep_interval_secs: 3600,
            ..idle_config(Some(1))
        };
        let clients = Clients::with_shared_handler(handler.clone(), WorkerConfig::default(), config);
        let (_id, worker, _client) = connect(&clients).await;

        assert_eq!(clients.sweep().await, 0);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(clients.sweep().await, 1);

        worker.closed().await;
        assert!(clients.is_empty());
        assert_eq!(handler.quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_registry_releases_handler() {
        let handler = Arc::new(Counter::default());
        let clients =
            Clients::with_shared_handler(handler.clone(), WorkerConfig::default(), idle_config(Some(1)));
        assert_eq!(Arc::strong_count(&handler), 2);

        drop(clients);
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn ids_wrap_at_limit() {
        let mut state = State {
            workers: HashMap::new(),
            last_id: 0,
            shutdown: false,
            shutdown_complete_tx: None,
        };
        assert_eq!(state.next_id(3), Ok(1));
        assert_eq!(state.next_id(3), Ok(2));
        assert_eq!(state.next_id(3), Ok(3));
        assert_eq!(state.next_id(3), Ok(1));
    }
}
