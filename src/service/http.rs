use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use super::{Service, ServiceError};
use crate::queue::http::{HttpBackend, HttpRequest, HttpSender};

/// HTTP 客户端的配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub queues: usize,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            timeout_secs: 5,
            queues: 1,
        }
    }
}

impl<S: HttpSender> Service<HttpBackend<S>> {
    /// 添加一组 HTTP 客户端，`connect`为每个分片创建一个`HttpSender`。
    pub fn add_client(
        &self,
        tag: &str,
        config: &HttpConfig,
        mut connect: impl FnMut(usize) -> S,
    ) -> bool {
        let timeout = config.timeout();
        self.add_pool(tag, config.queues, |shard| {
            HttpBackend::new(connect(shard), timeout)
        })
    }

    /// 发送请求并等待响应体。
    pub async fn send_request(&self, tag: &str, request: HttpRequest) -> Result<Bytes, ServiceError> {
        check(&request)?;
        self.send(tag, request).await
    }

    /// 发送请求，不等待响应。
    pub async fn send_request_async(&self, tag: &str, request: HttpRequest) -> Result<(), ServiceError> {
        check(&request)?;
        self.send_lazy(tag, request).await
    }
}

fn check(request: &HttpRequest) -> Result<(), ServiceError> {
    if request.url.is_empty() {
        return Err(ServiceError::LostParameters);
    }
    Ok(())
}
