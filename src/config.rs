//! 配置。
//!
//! 所有字段都有默认值，配置文件（TOML）里只需要写想要修改的部分。

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::DEFAULT_PORT;

/// 登录最多允许失败的次数。
pub const LOGIN_MAX_TRY_TIMES: u32 = 3;

/// 每个连接的下发信道的容量。
pub const CAST_CHANNEL_SIZE: usize = 64;

/// 连接 id 的上限，超过后从`1`重新开始。
pub const MAX_CLIENT_ID: u32 = 1 << 30;

/// 传递监听 socket 的环境变量名。
pub const LISTENER_ENV: &str = "LISTENER";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub clients: ClientsConfig,
    pub grace: GraceConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// 同时存在的最大连接数。
    pub max_connections: usize,
}

/// 单个连接的参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub login_max_try_times: u32,
    pub cast_channel_size: usize,
    pub read_buffer_size: usize,
    pub body_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub tick_secs: u64,

    /// `quit()`等待连接退出的时长。
    pub quit_wait_ms: u64,
}

/// 连接管理的参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientsConfig {
    pub max_client_id: u32,
    pub sweep_interval_secs: u64,

    /// 连接最长的空闲时间，`None`表示不清理空闲连接。
    pub max_idle_secs: Option<u64>,

    /// 关闭时等待所有连接退出的时长。
    pub drain_timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// 原始 socket 服务。
    #[default]
    Socket,

    /// HTTP 服务。
    Http,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GraceConfig {
    pub listener_env: String,
    pub flavor: Flavor,
    pub http_shutdown_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// error、warn、info、debug、trace 之一。
    pub level: String,
}

/// 读取配置时可能出现的错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("无法读取配置文件 {path}：{source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("无法解析配置文件 {path}：{source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl AppConfig {
    /// 从 TOML 文件中读取配置。
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        AppConfig::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// 从 TOML 字符串中解析配置。
    pub fn from_toml(content: &str) -> Result<AppConfig, toml::de::Error> {
        toml::from_str(content)
    }
}

impl ServerConfig {
    /// 监听地址。
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_connections: 250,
        }
    }
}

impl WorkerConfig {
    pub fn body_timeout(&self) -> Duration {
        Duration::from_millis(self.body_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn quit_wait(&self) -> Duration {
        Duration::from_millis(self.quit_wait_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            login_max_try_times: LOGIN_MAX_TRY_TIMES,
            cast_channel_size: CAST_CHANNEL_SIZE,
            read_buffer_size: crate::connection::DEFAULT_READ_BUFFER_SIZE,
            body_timeout_ms: 5_000,
            write_timeout_ms: 1_000,
            tick_secs: 30,
            quit_wait_ms: 100,
        }
    }
}

impl ClientsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn max_idle(&self) -> Option<Duration> {
        self.max_idle_secs.map(Duration::from_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        ClientsConfig {
            max_client_id: MAX_CLIENT_ID,
            sweep_interval_secs: 30,
            max_idle_secs: Some(120),
            drain_timeout_ms: 3_000,
        }
    }
}

impl GraceConfig {
    pub fn http_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.http_shutdown_timeout_secs)
    }
}

impl Default for GraceConfig {
    fn default() -> Self {
        GraceConfig {
            listener_env: LISTENER_ENV.to_string(),
            flavor: Flavor::Socket,
            http_shutdown_timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.worker.login_max_try_times, 3);
        assert_eq!(config.clients.max_client_id, 1 << 30);
        assert_eq!(config.grace.listener_env, "LISTENER");
    }

    #[test]
    fn partial_sections_override_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            port = 7200

            [clients]
            max_idle_secs = 15

            [grace]
            flavor = "http"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 7200);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.addr(), "127.0.0.1:7200");
        assert_eq!(config.clients.max_idle(), Some(Duration::from_secs(15)));
        assert_eq!(config.clients.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.grace.flavor, Flavor::Http);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn unknown_flavor_is_rejected() {
        assert!(AppConfig::from_toml("[grace]\nflavor = \"udp\"").is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = AppConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
