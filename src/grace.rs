//! 不中断服务的重启。
//!
//! 收到`SIGHUP`或`SIGUSR2`时，以同样的参数重新启动当前程序，并把监听 socket
//! 作为文件描述符`3`传给新进程，新进程通过环境变量里的 JSON 找到它：
//!
//! ```text
//! LISTENER={"addr":"0.0.0.0:6170","fd":3,"filename":"tcp:0.0.0.0:6170"}
//! ```
//!
//! 收到`SIGINT`、`SIGTERM`或`SIGQUIT`时发出`GraceEvent::Stop`，由调用方负责关闭服务。

use std::{
    env, fmt, io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        process::CommandExt,
    },
    process::{Command, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::broadcast,
};
use tracing::{error, info, warn};

use crate::config::{Flavor, GraceConfig};

/// 新进程中监听 socket 的文件描述符。
pub const INHERITED_FD: RawFd = 3;

/// 环境变量中记录的监听 socket 信息。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InheritedListener {
    pub addr: String,
    pub fd: RawFd,
    pub filename: String,
}

/// 会被处理的信号。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Hangup,
    User2,
    Interrupt,
    Terminate,
    Quit,
}

/// 处理信号的结果，通过`Grace::subscribe()`接收。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraceEvent {
    /// 已经启动了新进程。
    Forked { pid: u32 },

    /// 当前进程应该停止服务。
    Stop { signal: Signal },
}

#[derive(Debug, thiserror::Error)]
pub enum GraceError {
    #[error("无法监听 {addr}：{source}")]
    Bind { addr: String, source: io::Error },

    #[error("环境变量中的监听信息不合法：{0}")]
    Env(#[from] serde_json::Error),

    #[error("继承的文件描述符 {fd} 不可用：{source}")]
    BadFd { fd: RawFd, source: io::Error },

    #[error("I/O 错误：{0}")]
    Io(#[from] io::Error),
}

/// 监听 socket 的持有者，负责重启和信号处理。
pub struct Grace {
    addr: String,
    listener: StdTcpListener,
    config: GraceConfig,
    inherited: bool,
    forked: AtomicBool,
    events: broadcast::Sender<GraceEvent>,
}

impl Signal {
    fn name(&self) -> &'static str {
        match self {
            Signal::Hangup => "SIGHUP",
            Signal::User2 => "SIGUSR2",
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Grace {
    /// 获取`addr`上的监听 socket。
    ///
    /// 环境变量里有同一个地址的监听信息时使用继承来的 socket，否则重新监听。
    pub fn bind(config: &GraceConfig, addr: &str) -> Result<Grace, GraceError> {
        let (listener, inherited) = match import_listener(&config.listener_env, addr)? {
            Some(listener) => {
                info!(addr, "使用继承的监听 socket");
                (listener, true)
            }
            None => {
                let listener = StdTcpListener::bind(addr).map_err(|source| GraceError::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
                (listener, false)
            }
        };

        let (events, _) = broadcast::channel(16);
        Ok(Grace {
            addr: addr.to_string(),
            listener,
            config: config.clone(),
            inherited,
            forked: AtomicBool::new(false),
            events,
        })
    }

    /// 返回监听 socket 的一个副本，必须在 tokio 运行时内调用。
    pub fn listener(&self) -> Result<TcpListener, GraceError> {
        let listener = self.listener.try_clone()?;
        listener.set_nonblocking(true)?;
        Ok(TcpListener::from_std(listener)?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GraceError> {
        Ok(self.listener.local_addr()?)
    }

    /// 监听 socket 是否是从父进程继承的。
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// 当前进程是否已经启动过新进程。
    pub fn has_forked(&self) -> bool {
        self.forked.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraceEvent> {
        self.events.subscribe()
    }

    /// HTTP 服务停止时的最长等待时间，原始 socket 服务返回`None`。
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        match self.config.flavor {
            Flavor::Http => Some(self.config.http_shutdown_timeout()),
            Flavor::Socket => None,
        }
    }

    /// 处理信号，不会返回，除非无法注册信号。
    pub async fn start(&self) -> Result<(), GraceError> {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut user2 = signal(SignalKind::user_defined2())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;

        loop {
            let signal = tokio::select! {
                _ = hangup.recv() => Signal::Hangup,
                _ = user2.recv() => Signal::User2,
                _ = interrupt.recv() => Signal::Interrupt,
                _ = terminate.recv() => Signal::Terminate,
                _ = quit.recv() => Signal::Quit,
            };
            self.handle_signal(signal);
        }
    }

    /// 处理一个信号，并把结果发送给订阅者。
    pub fn handle_signal(&self, signal: Signal) {
        info!(%signal, "收到信号");
        match signal {
            Signal::Hangup | Signal::User2 => {
                let pid = match self.fork_child() {
                    Ok(pid) => pid,
                    Err(err) => {
                        error!(%err, "无法启动新进程");
                        return;
                    }
                };
                self.forked.store(true, Ordering::SeqCst);
                info!(pid, "已启动新进程");
                self.publish(GraceEvent::Forked { pid });

                // HTTP 服务把新连接交给新进程，自己尽快退出。
                if self.config.flavor == Flavor::Http {
                    self.publish(GraceEvent::Stop { signal });
                }
            }
            Signal::Interrupt | Signal::Terminate | Signal::Quit => {
                self.publish(GraceEvent::Stop { signal });
            }
        }
    }

    /// 以同样的参数启动当前程序，监听 socket 作为文件描述符`3`传过去。
    ///
    /// 标准输入、输出和错误输出都继承给新进程。
    pub fn fork_child(&self) -> Result<u32, GraceError> {
        let fd = self.listener.as_raw_fd();
        let inherited = self.inherited_listener();

        let exe = env::current_exe()?;
        let mut command = Command::new(&exe);
        command
            .args(env::args_os().skip(1))
            .env(&self.config.listener_env, serde_json::to_string(&inherited)?)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = exe.parent() {
            command.current_dir(dir);
        }

        // SAFETY: 闭包在 fork 之后、exec 之前运行，只调用了 async-signal-safe 的函数。
        unsafe {
            command.pre_exec(move || {
                if fd == INHERITED_FD {
                    // `dup2`对同一个描述符什么都不做，需要手动去掉 close-on-exec。
                    if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, INHERITED_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        Ok(child.id())
    }

    /// 传给新进程的监听信息。
    pub fn inherited_listener(&self) -> InheritedListener {
        InheritedListener {
            addr: self.addr.clone(),
            fd: INHERITED_FD,
            filename: format!("tcp:{}", self.addr),
        }
    }

    fn publish(&self, event: GraceEvent) {
        // 没有订阅者时发送失败，忽略即可。
        if self.events.send(event).is_err() {
            warn!("没有订阅者接收事件");
        }
    }
}

impl fmt::Debug for Grace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grace")
            .field("addr", &self.addr)
            .field("inherited", &self.inherited)
            .field("forked", &self.has_forked())
            .finish()
    }
}

/// 从环境变量中导入监听 socket。
///
/// 环境变量不存在、无法解析或记录的地址与`addr`不同时返回`Ok(None)`。
fn import_listener(env_name: &str, addr: &str) -> Result<Option<StdTcpListener>, GraceError> {
    let Ok(value) = env::var(env_name) else {
        return Ok(None);
    };
    let inherited = match parse_inherited(&value) {
        Ok(inherited) => inherited,
        Err(err) => {
            warn!(%err, env = env_name, "忽略不合法的监听信息");
            return Ok(None);
        }
    };
    if inherited.addr != addr {
        return Ok(None);
    }

    let fd = inherited.fd;
    // SAFETY: 只检查描述符是否存在。
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(GraceError::BadFd {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: 父进程把监听 socket 放在了这个描述符上，之后由`StdTcpListener`独占。
    let listener = unsafe { StdTcpListener::from_raw_fd(fd) };
    Ok(Some(listener))
}

/// 解析环境变量中的 JSON。
pub fn parse_inherited(value: &str) -> Result<InheritedListener, GraceError> {
    Ok(serde_json::from_str(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;

    fn config(env_name: &str, flavor: Flavor) -> GraceConfig {
        GraceConfig {
            listener_env: env_name.to_string(),
            flavor,
            ..GraceConfig::default()
        }
    }

    #[test]
    fn parses_listener_env() {
        let inherited =
            parse_inherited(r#"{"addr":"0.0.0.0:6170","fd":3,"filename":"tcp:0.0.0.0:6170"}"#)
                .unwrap();
        assert_eq!(inherited.addr, "0.0.0.0:6170");
        assert_eq!(inherited.fd, 3);
        assert!(parse_inherited("not json").is_err());
    }

    #[test]
    fn binds_fresh_without_env() {
        let grace = Grace::bind(&config("TINYCELLS_TEST_NO_LISTENER", Flavor::Socket), "127.0.0.1:0")
            .unwrap();
        assert!(!grace.is_inherited());
        assert!(!grace.has_forked());
        assert_eq!(grace.shutdown_timeout(), None);

        let inherited = grace.inherited_listener();
        assert_eq!(inherited.fd, INHERITED_FD);
        assert_eq!(inherited.addr, "127.0.0.1:0");
    }

    #[test]
    fn imports_listener_for_same_addr() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let local = listener.local_addr().unwrap();
        let addr = local.to_string();
        let fd = listener.into_raw_fd();

        let env_name = "TINYCELLS_TEST_IMPORT_LISTENER";
        let value = serde_json::to_string(&InheritedListener {
            addr: addr.clone(),
            fd,
            filename: format!("tcp:{addr}"),
        })
        .unwrap();
        env::set_var(env_name, value);

        let grace = Grace::bind(&config(env_name, Flavor::Socket), &addr).unwrap();
        assert!(grace.is_inherited());
        assert_eq!(grace.local_addr().unwrap(), local);

        // 地址不同时重新监听。
        let other = Grace::bind(&config(env_name, Flavor::Socket), "127.0.0.1:0").unwrap();
        assert!(!other.is_inherited());
        env::remove_var(env_name);
    }

    #[tokio::test]
    async fn stop_signals_are_published() {
        let grace = Grace::bind(&config("TINYCELLS_TEST_STOP", Flavor::Http), "127.0.0.1:0").unwrap();
        let mut events = grace.subscribe();

        grace.handle_signal(Signal::Terminate);
        assert_eq!(
            events.recv().await.unwrap(),
            GraceEvent::Stop {
                signal: Signal::Terminate
            }
        );
        assert!(!grace.has_forked());
        assert_eq!(grace.shutdown_timeout(), Some(Duration::from_secs(10)));

        let listener = grace.listener().unwrap();
        assert_eq!(listener.local_addr().unwrap(), grace.local_addr().unwrap());
    }
}
