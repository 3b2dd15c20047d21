use serde::Deserialize;

use super::{Service, ServiceError};
use crate::queue::redis::{RedisBackend, RedisExecutor, RedisRequest, RedisValue};

/// 一个 Redis 服务的配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port`
    pub server: String,
    pub password: String,
    pub db: u32,
    pub pools: usize,
    pub queues: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            server: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
            pools: 5,
            queues: 1,
        }
    }
}

impl<R: RedisExecutor> Service<RedisBackend<R>> {
    /// 添加一个 Redis 服务，`connect`为每个分片创建一个`RedisExecutor`。
    pub fn add_redis(
        &self,
        tag: &str,
        config: &RedisConfig,
        mut connect: impl FnMut(&RedisConfig, usize) -> R,
    ) -> bool {
        self.add_pool(tag, config.queues, |shard| {
            RedisBackend::new(connect(config, shard))
        })
    }

    pub async fn command(
        &self,
        tag: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<RedisValue, ServiceError> {
        self.command_with_expire(tag, command, args, 0).await
    }

    /// 执行命令，成功后为第一个参数设置`expire_seconds`秒的过期时间。
    pub async fn command_with_expire(
        &self,
        tag: &str,
        command: &str,
        args: Vec<String>,
        expire_seconds: u64,
    ) -> Result<RedisValue, ServiceError> {
        if command.is_empty() {
            return Err(ServiceError::LostParameters);
        }
        let request = RedisRequest::Command {
            command: command.to_string(),
            args,
            expire_seconds,
        };
        self.send(tag, request).await
    }

    pub async fn script(
        &self,
        tag: &str,
        script: &str,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<RedisValue, ServiceError> {
        if script.is_empty() {
            return Err(ServiceError::LostParameters);
        }
        let request = RedisRequest::Script {
            script: script.to_string(),
            keys,
            args,
        };
        self.send(tag, request).await
    }

    /// 抢锁，抢到返回`true`。
    ///
    /// 同一个 key 的锁请求走同一个分片。
    pub async fn lock(&self, tag: &str, key: &str, expire_seconds: u64) -> Result<bool, ServiceError> {
        if key.is_empty() || expire_seconds == 0 {
            return Err(ServiceError::LostParameters);
        }
        let request = RedisRequest::Lock {
            key: key.to_string(),
            expire_seconds,
        };
        Ok(self.send_keyed(tag, &key, request).await?.as_bool())
    }
}
