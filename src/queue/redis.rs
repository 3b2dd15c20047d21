//! Redis 请求队列的后端。

use std::{
    future::Future,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::warn;

use super::Backend;

/// 请求信道的默认容量。
pub const DEFAULT_CHANNEL_SIZE: usize = 256;

/// 原子锁脚本。
///
/// `KEYS[1]`为锁的 key，`ARGV[1]`为锁的过期时间戳，`ARGV[2]`为当前时间戳。
/// 抢到锁返回`1`，否则返回`nil`。锁已经过期时删除后重新抢。
pub const LOCK_SCRIPT: &str = r#"
local key = KEYS[1]
local val = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
if redis.call('SETNX', key, val) > 0 then
    return true
end
local old = tonumber(redis.call('GET', key))
if old == nil or old < now then
    redis.call('DEL', key)
    if redis.call('SETNX', key, val) > 0 then
        return true
    end
end
return false
"#;

/// Redis 的返回值。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedisValue {
    Nil,
    Int(i64),
    Bulk(Vec<u8>),
    Status(String),
    Array(Vec<RedisValue>),
}

/// 执行 Redis 命令。
pub trait RedisExecutor: Send + 'static {
    fn execute(
        &mut self,
        command: &str,
        args: &[String],
    ) -> impl Future<Output = crate::Result<RedisValue>> + Send;

    /// 执行 Lua 脚本，默认通过`EVAL`命令实现。
    fn eval(
        &mut self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> impl Future<Output = crate::Result<RedisValue>> + Send {
        let mut full = Vec::with_capacity(2 + keys.len() + args.len());
        full.push(script.to_string());
        full.push(keys.len().to_string());
        full.extend(keys.iter().cloned());
        full.extend(args.iter().cloned());
        async move { self.execute("EVAL", &full).await }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedisRequest {
    /// 普通命令。`expire_seconds`大于`0`并且命令成功时，再为第一个参数设置过期时间。
    Command {
        command: String,
        args: Vec<String>,
        expire_seconds: u64,
    },

    /// Lua 脚本。
    Script {
        script: String,
        keys: Vec<String>,
        args: Vec<String>,
    },

    /// 抢一把在`expire_seconds`秒后过期的锁。
    Lock { key: String, expire_seconds: u64 },
}

/// 把`RedisExecutor`包装为队列后端。
#[derive(Debug)]
pub struct RedisBackend<R> {
    executor: R,
}

impl RedisValue {
    /// 整数非`0`、状态为`OK`、非空字符串都视为`true`。
    pub fn as_bool(&self) -> bool {
        match self {
            RedisValue::Nil => false,
            RedisValue::Int(n) => *n != 0,
            RedisValue::Bulk(bytes) => !bytes.is_empty(),
            RedisValue::Status(status) => status.eq_ignore_ascii_case("OK"),
            RedisValue::Array(values) => !values.is_empty(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RedisValue::Int(n) => Some(*n),
            RedisValue::Bulk(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RedisValue::Bulk(bytes) => std::str::from_utf8(bytes).ok(),
            RedisValue::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RedisValue::Nil)
    }
}

impl RedisRequest {
    pub fn command(command: impl Into<String>, args: Vec<String>) -> RedisRequest {
        RedisRequest::Command {
            command: command.into(),
            args,
            expire_seconds: 0,
        }
    }
}

impl<R: RedisExecutor> RedisBackend<R> {
    pub fn new(executor: R) -> RedisBackend<R> {
        RedisBackend { executor }
    }

    pub fn executor(&self) -> &R {
        &self.executor
    }

    async fn command(
        &mut self,
        command: &str,
        args: &[String],
        expire_seconds: u64,
    ) -> crate::Result<RedisValue> {
        let value = self.executor.execute(command, args).await?;

        if expire_seconds > 0 {
            if let Some(key) = args.first() {
                let expire = [key.clone(), expire_seconds.to_string()];
                // 过期时间设置失败不影响命令本身的结果。
                if let Err(err) = self.executor.execute("EXPIRE", &expire).await {
                    warn!(%err, key = %key, "设置过期时间失败");
                }
            }
        }
        Ok(value)
    }

    async fn lock(&mut self, key: &str, expire_seconds: u64) -> crate::Result<RedisValue> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let keys = [key.to_string()];
        let args = [now.saturating_add(expire_seconds).to_string(), now.to_string()];
        self.executor.eval(LOCK_SCRIPT, &keys, &args).await
    }
}

impl<R: RedisExecutor> Backend for RedisBackend<R> {
    type Request = RedisRequest;
    type Reply = RedisValue;

    async fn call(&mut self, request: RedisRequest) -> crate::Result<RedisValue> {
        match request {
            RedisRequest::Command {
                command,
                args,
                expire_seconds,
            } => self.command(&command, &args, expire_seconds).await,
            RedisRequest::Script { script, keys, args } => {
                self.executor.eval(&script, &keys, &args).await
            }
            RedisRequest::Lock {
                key,
                expire_seconds,
            } => self.lock(&key, expire_seconds).await,
        }
    }
}
