use std::str::FromStr;

use tracing::Level;

use crate::config::LoggingConfig;

/// 安装全局的日志订阅者。
///
/// 不认识的日志级别按`info`处理。已经安装过订阅者时返回`Err`，可以忽略。
pub fn init(config: &LoggingConfig) -> crate::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(&config.level))
        .with_target(false)
        .try_init()
}

fn parse_level(level: &str) -> Level {
    Level::from_str(level.trim()).unwrap_or(Level::INFO)
}
