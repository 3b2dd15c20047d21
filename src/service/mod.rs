//! 分片的请求队列。
//!
//! `Pool`由若干个`Queue`组成，每个分片各自持有一个后端；`Service`按标签管理
//! 多个`Pool`，例如每个数据库一个标签。

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, RwLock},
};

use futures::future::join_all;
use rand::Rng;
use tracing::{debug, info};

use crate::queue::{Backend, Queue, QueueError, DEFAULT_CHANNEL_SIZE};

pub mod http;
pub mod mysql;
pub mod redis;

/// 选择分片。
pub trait ShardPicker: Send + Sync + 'static {
    /// 从`0..shards`中选择一个，`shards`至少为`1`。
    fn pick(&self, shards: usize) -> usize;
}

/// 均匀随机地选择分片。
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomPicker;

impl ShardPicker for RandomPicker {
    fn pick(&self, shards: usize) -> usize {
        rand::thread_rng().gen_range(0..shards)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("lost parameters")]
    LostParameters,

    #[error("没有标签为 {0} 的服务")]
    UnknownTag(String),

    #[error("没有可用的分片")]
    NoShard,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// 一组分片，分片编号从`1`开始。
pub struct Pool<B: Backend> {
    shards: Vec<Queue<B>>,
    picker: Arc<dyn ShardPicker>,
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Pool {
            shards: self.shards.clone(),
            picker: self.picker.clone(),
        }
    }
}

impl<B: Backend> Pool<B> {
    /// 创建`shard_count`个分片，`factory`的参数为分片编号。
    pub fn new(shard_count: usize, channel_size: usize, factory: impl FnMut(usize) -> B) -> Pool<B> {
        Pool::with_picker(shard_count, channel_size, factory, RandomPicker)
    }

    pub fn with_picker(
        shard_count: usize,
        channel_size: usize,
        mut factory: impl FnMut(usize) -> B,
        picker: impl ShardPicker,
    ) -> Pool<B> {
        let shards = (1..=shard_count)
            .map(|index| Queue::new(factory(index), channel_size))
            .collect();
        Pool {
            shards,
            picker: Arc::new(picker),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// 按编号获取分片，编号从`1`开始。
    pub fn shard(&self, index: usize) -> Option<&Queue<B>> {
        index.checked_sub(1).and_then(|i| self.shards.get(i))
    }

    /// 随机选一个没有关闭的分片，提交请求并等待回复。
    pub async fn send(&self, request: B::Request) -> Result<B::Reply, ServiceError> {
        Ok(self.pick()?.submit(request).await?)
    }

    /// 随机选一个没有关闭的分片，提交请求，不等待回复。
    pub async fn send_lazy(&self, request: B::Request) -> Result<(), ServiceError> {
        Ok(self.pick()?.submit_lazy(request).await?)
    }

    /// 按`key`的哈希选择分片，同一个`key`的请求按提交顺序执行。
    pub async fn send_keyed(
        &self,
        key: &impl Hash,
        request: B::Request,
    ) -> Result<B::Reply, ServiceError> {
        if self.shards.is_empty() {
            return Err(ServiceError::NoShard);
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        Ok(self.shards[index].submit(request).await?)
    }

    /// 关闭所有分片，等待它们处理完已经提交的请求。
    pub async fn quit(&self) {
        join_all(self.shards.iter().map(|queue| queue.quit())).await;
    }

    fn pick(&self) -> Result<&Queue<B>, ServiceError> {
        let live: Vec<&Queue<B>> = self.shards.iter().filter(|q| !q.is_closed()).collect();
        if live.is_empty() {
            return Err(ServiceError::NoShard);
        }
        let index = self.picker.pick(live.len()).min(live.len() - 1);
        Ok(live[index])
    }
}

impl<B: Backend> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("shards", &self.shards).finish()
    }
}

/// 按标签管理多组分片。
pub struct Service<B: Backend> {
    pools: RwLock<HashMap<String, Pool<B>>>,
    channel_size: usize,
}

impl<B: Backend> Service<B> {
    pub fn new() -> Service<B> {
        Service::with_channel_size(DEFAULT_CHANNEL_SIZE)
    }

    /// 新建的每个分片的请求信道容量为`channel_size`。
    pub fn with_channel_size(channel_size: usize) -> Service<B> {
        Service {
            pools: RwLock::new(HashMap::new()),
            channel_size,
        }
    }

    /// 添加一组分片。
    ///
    /// 标签为空、`shard_count`为`0`或者标签已经存在时返回`false`。
    pub fn add_pool(&self, tag: &str, shard_count: usize, factory: impl FnMut(usize) -> B) -> bool {
        if tag.is_empty() || shard_count == 0 || self.contains(tag) {
            return false;
        }
        self.insert_pool(tag, Pool::new(shard_count, self.channel_size, factory))
    }

    /// 添加一个已经创建好的`Pool`，标签已经存在时返回`false`。
    pub fn insert_pool(&self, tag: &str, pool: Pool<B>) -> bool {
        if tag.is_empty() {
            return false;
        }
        let mut pools = self.pools.write().unwrap();
        if pools.contains_key(tag) {
            return false;
        }
        info!(tag, shards = pool.shard_count(), "添加服务");
        pools.insert(tag.to_string(), pool);
        true
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.pools.read().unwrap().contains_key(tag)
    }

    pub fn pool(&self, tag: &str) -> Option<Pool<B>> {
        self.pools.read().unwrap().get(tag).cloned()
    }

    /// 所有标签，按字典序排列。
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.pools.read().unwrap().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub async fn send(&self, tag: &str, request: B::Request) -> Result<B::Reply, ServiceError> {
        self.lookup(tag)?.send(request).await
    }

    pub async fn send_lazy(&self, tag: &str, request: B::Request) -> Result<(), ServiceError> {
        self.lookup(tag)?.send_lazy(request).await
    }

    pub async fn send_keyed(
        &self,
        tag: &str,
        key: &impl Hash,
        request: B::Request,
    ) -> Result<B::Reply, ServiceError> {
        self.lookup(tag)?.send_keyed(key, request).await
    }

    /// 关闭并移除所有分片。
    pub async fn quit(&self) {
        let pools: Vec<(String, Pool<B>)> = self.pools.write().unwrap().drain().collect();
        for (tag, pool) in pools {
            pool.quit().await;
            debug!(tag = %tag, "服务已关闭");
        }
    }

    // 在锁外使用`Pool`，锁不会跨越`.await`。
    fn lookup(&self, tag: &str) -> Result<Pool<B>, ServiceError> {
        if tag.is_empty() {
            return Err(ServiceError::LostParameters);
        }
        self.pool(tag)
            .ok_or_else(|| ServiceError::UnknownTag(tag.to_string()))
    }
}

impl<B: Backend> Default for Service<B> {
    fn default() -> Self {
        Service::new()
    }
}

impl<B: Backend> fmt::Debug for Service<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("tags", &self.tags())
            .field("channel_size", &self.channel_size)
            .finish()
    }
}
