//! HTTP 请求队列的后端。
//!
//! 这里只负责把`HttpRequest`整理为可以直接发送的`PreparedRequest`，
//! 发送由`HttpSender`完成。每个请求都带`Connection: close`，不复用连接。

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{fs, time};
use tracing::debug;
use url::Url;

use super::Backend;

/// 默认的请求超时时间。
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// 要上传的文件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileUpload {
    pub path: PathBuf,

    /// 表单中文件字段的名字。
    pub field: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub body: Bytes,
    pub file: Option<FileUpload>,
}

/// 整理好、可以直接发送的请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// 发送 HTTP 请求，返回响应体。
pub trait HttpSender: Send + 'static {
    fn send(
        &mut self,
        request: PreparedRequest,
    ) -> impl Future<Output = crate::Result<Bytes>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("缺少 url")]
    MissingUrl,

    #[error("无法读取上传的文件 {path}：{source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("请求超时")]
    Timeout,

    #[error("无效的 url {url}：{source}")]
    BadUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("无法编码参数：{0}")]
    Encode(#[from] serde_urlencoded::ser::Error),
}

/// 把`HttpSender`包装为队列后端。
#[derive(Debug)]
pub struct HttpBackend<S> {
    sender: S,
    timeout: Duration,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            url: url.into(),
            ..HttpRequest::default()
        }
    }

    pub fn post(url: impl Into<String>) -> HttpRequest {
        HttpRequest {
            method: Method::Post,
            url: url.into(),
            ..HttpRequest::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> HttpRequest {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> HttpRequest {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> HttpRequest {
        self.body = body.into();
        self
    }

    /// 上传文件，请求会变为`multipart/form-data`的 POST。
    pub fn file(mut self, path: impl Into<PathBuf>, field: impl Into<String>) -> HttpRequest {
        self.file = Some(FileUpload {
            path: path.into(),
            field: field.into(),
        });
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|key| key.eq_ignore_ascii_case(name))
    }

    /// 整理请求。
    ///
    /// - 上传文件：POST，参数作为表单字段和文件一起放进 multipart 数据体；
    /// - GET：参数拼接到 url 上，忽略数据体；
    /// - POST：数据体为编码后的参数加上原始数据体，没有指定`Content-Type`时
    ///   使用`application/x-www-form-urlencoded`。
    ///
    /// 最后加上所有自定义的请求头和`Connection: close`。
    pub async fn prepare(self) -> Result<PreparedRequest, HttpError> {
        if self.url.is_empty() {
            return Err(HttpError::MissingUrl);
        }

        let mut headers = Vec::new();
        let (method, url, body) = match &self.file {
            Some(file) if !file.field.is_empty() && !file.path.as_os_str().is_empty() => {
                let boundary = boundary();
                let body = multipart_body(&boundary, file, &self.params).await?;
                headers.push((
                    "Content-Type".to_string(),
                    format!("multipart/form-data; boundary={boundary}"),
                ));
                (Method::Post, self.url.clone(), body)
            }
            _ => match self.method {
                Method::Get => (Method::Get, append_query(&self.url, &self.params)?, Bytes::new()),
                Method::Post => {
                    let mut body = BytesMut::new();
                    body.put_slice(url_encode(&self.params)?.as_bytes());
                    body.put_slice(&self.body);
                    if !self.has_header("Content-Type") {
                        headers.push(("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string()));
                    }
                    (Method::Post, self.url.clone(), body.freeze())
                }
            },
        };

        for (name, value) in self.headers {
            if name.eq_ignore_ascii_case("Connection") {
                continue;
            }
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            headers.push((name, value));
        }
        headers.push(("Connection".to_string(), "close".to_string()));

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
        })
    }
}

impl PreparedRequest {
    /// 按名字查找请求头，不区分大小写。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl<S: HttpSender> HttpBackend<S> {
    pub fn new(sender: S, timeout: Duration) -> HttpBackend<S> {
        HttpBackend { sender, timeout }
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }
}

impl<S: HttpSender> Backend for HttpBackend<S> {
    type Request = HttpRequest;
    type Reply = Bytes;

    async fn call(&mut self, request: HttpRequest) -> crate::Result<Bytes> {
        let prepared = request.prepare().await?;
        debug!(method = %prepared.method, url = %prepared.url, "发送请求");

        match time::timeout(self.timeout, self.sender.send(prepared)).await {
            Ok(res) => res,
            Err(_) => Err(HttpError::Timeout.into()),
        }
    }
}

/// 按`application/x-www-form-urlencoded`编码参数。
pub fn url_encode(params: &BTreeMap<String, String>) -> Result<String, HttpError> {
    Ok(serde_urlencoded::to_string(params)?)
}

/// 把参数追加到 url 的查询部分，片段（`#...`）保持在最后。
fn append_query(url: &str, params: &BTreeMap<String, String>) -> Result<String, HttpError> {
    if params.is_empty() {
        return Ok(url.to_string());
    }
    let mut full = Url::parse(url).map_err(|source| HttpError::BadUrl {
        url: url.to_string(),
        source,
    })?;
    full.query_pairs_mut().extend_pairs(params);
    Ok(full.into())
}

fn boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("tinycells{suffix}")
}

async fn multipart_body(
    boundary: &str,
    file: &FileUpload,
    params: &BTreeMap<String, String>,
) -> Result<Bytes, HttpError> {
    let content = fs::read(&file.path).await.map_err(|source| HttpError::File {
        path: file.path.clone(),
        source,
    })?;
    let filename = file_name(&file.path);

    let mut body = BytesMut::with_capacity(content.len() + 256);
    body.put_slice(format!("--{boundary}\r\n").as_bytes());
    body.put_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\n",
            file.field
        )
        .as_bytes(),
    );
    body.put_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.put_slice(&content);
    body.put_slice(b"\r\n");

    for (name, value) in params {
        body.put_slice(format!("--{boundary}\r\n").as_bytes());
        body.put_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.put_slice(value.as_bytes());
        body.put_slice(b"\r\n");
    }
    body.put_slice(format!("--{boundary}--\r\n").as_bytes());

    Ok(body.freeze())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_params() {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), "tiny cells".to_string());
        params.insert("q".to_string(), "a&b=c".to_string());
        assert_eq!(url_encode(&params).unwrap(), "name=tiny+cells&q=a%26b%3Dc");
        assert_eq!(url_encode(&BTreeMap::new()).unwrap(), "");
    }

    #[tokio::test]
    async fn query_goes_before_fragment() {
        let prepared = HttpRequest::get("http://example.com/page#top")
            .param("id", "7")
            .param("q", "a b")
            .prepare()
            .await
            .unwrap();
        assert_eq!(prepared.url, "http://example.com/page?id=7&q=a+b#top");

        assert!(matches!(
            HttpRequest::get("not a url").param("id", "7").prepare().await,
            Err(HttpError::BadUrl { .. })
        ));
    }

    #[tokio::test]
    async fn get_puts_params_in_url() {
        let prepared = HttpRequest::get("http://example.com/api?x=1")
            .param("id", "7")
            .body("ignored")
            .prepare()
            .await
            .unwrap();

        assert_eq!(prepared.method, Method::Get);
        assert_eq!(prepared.url, "http://example.com/api?x=1&id=7");
        assert!(prepared.body.is_empty());
        assert_eq!(prepared.header("connection"), Some("close"));
    }

    #[tokio::test]
    async fn post_carries_params_then_body() {
        let prepared = HttpRequest::post("http://example.com/api")
            .param("a", "1")
            .body("&raw")
            .prepare()
            .await
            .unwrap();

        assert_eq!(&prepared.body[..], b"a=1&raw");
        assert_eq!(prepared.header("Content-Type"), Some(FORM_CONTENT_TYPE));
        assert_eq!(prepared.header("Connection"), Some("close"));

        let prepared = HttpRequest::post("http://example.com/api")
            .header("content-type", "application/json")
            .header("Connection", "keep-alive")
            .body("{}")
            .prepare()
            .await
            .unwrap();
        assert_eq!(prepared.header("Content-Type"), Some("application/json"));
        assert_eq!(prepared.header("Connection"), Some("close"));
        assert_eq!(prepared.headers.len(), 2);
    }

    #[tokio::test]
    async fn file_upload_builds_multipart() {
        let path = std::env::temp_dir().join(format!("tinycells-upload-{}.txt", std::process::id()));
        std::fs::write(&path, b"file content").unwrap();

        let prepared = HttpRequest::get("http://example.com/upload")
            .file(&path, "avatar")
            .param("user", "7")
            .prepare()
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(prepared.method, Method::Post);
        let content_type = prepared.header("Content-Type").unwrap();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap();

        let body = String::from_utf8(prepared.body.to_vec()).unwrap();
        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.contains("name=\"avatar\"; filename=\"tinycells-upload-"));
        assert!(body.contains("\r\n\r\nfile content\r\n"));
        assert!(body.contains("name=\"user\"\r\n\r\n7\r\n"));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn missing_file_and_url_are_errors() {
        assert!(matches!(
            HttpRequest::get("").prepare().await,
            Err(HttpError::MissingUrl)
        ));
        assert!(matches!(
            HttpRequest::post("http://example.com")
                .file("/definitely/not/here", "f")
                .prepare()
                .await,
            Err(HttpError::File { .. })
        ));
    }

    struct Slow;

    impl HttpSender for Slow {
        async fn send(&mut self, _request: PreparedRequest) -> crate::Result<Bytes> {
            time::sleep(Duration::from_secs(60)).await;
            Ok(Bytes::from_static(b"late"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sender_times_out() {
        let mut backend = HttpBackend::new(Slow, DEFAULT_TIMEOUT);
        let err = backend
            .call(HttpRequest::get("http://example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "请求超时");
    }
}
