//! tinycells-server
//!
//! 这个文件是服务器实现的入口点，使用了 clap 第三方库
//! 进行命令行参数解析

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tinycells::{
    config::AppConfig,
    grace::{Grace, GraceEvent},
    logging, server, Clients, Router,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "tinycells-server",
    author,
    version,
    about = "基于长度前缀数据包协议的 TCP 服务器"
)]
struct Args {
    /// 配置文件（TOML）。
    #[arg(long)]
    config: Option<PathBuf>,

    /// 监听端口，覆盖配置文件。
    #[arg(long)]
    port: Option<u16>,

    /// 日志级别，覆盖配置文件。
    #[arg(long)]
    log_level: Option<String>,
}

#[test]
fn verify_args() {
    // clap 库提供的测试，可以帮助找出绝大部分的开发错误。
    use clap::CommandFactory;
    Args::command().debug_assert();
}

#[tokio::main]
pub async fn main() -> tinycells::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    logging::init(&config.logging)?;

    let grace = Arc::new(Grace::bind(&config.grace, &config.server.addr())?);
    let listener = grace.listener()?;
    let addr = grace.local_addr()?;
    info!(%addr, inherited = grace.is_inherited(), "服务器启动");

    // 先订阅再处理信号，避免错过事件。
    let mut events = grace.subscribe();
    let signals = grace.clone();
    tokio::spawn(async move {
        if let Err(err) = signals.start().await {
            error!(%err, "无法处理信号");
        }
    });

    let shutdown = async move {
        loop {
            match events.recv().await {
                Ok(GraceEvent::Stop { signal }) => {
                    info!(%signal, "准备关闭");
                    break;
                }
                Ok(GraceEvent::Forked { pid }) => info!(pid, "新进程已启动"),
                // 事件太多被覆盖，继续等待。
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    let clients = Clients::new(Router::new(), config.worker.clone(), config.clients.clone());
    server::run(listener, clients, &config.server, shutdown).await;

    Ok(())
}
