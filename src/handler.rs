//! 连接的回调接口，以及一个基于`Dispatcher`的示例实现。

use std::future::Future;

use bytes::Bytes;
use tracing::{debug, info};

use crate::{dispatch::Dispatcher, packet::Packet, WorkerHandle};

/// 连接的回调。
///
/// 所有回调都在连接的读循环上被等待，回调越慢，这个连接的吞吐量越低。
pub trait Handler: Send + Sync + 'static {
    /// 未登录的连接每收到一个数据包调用一次。
    ///
    /// 返回会话 id，小于等于`0`表示登录失败。`conn`可以用来回写数据。
    fn login(&self, conn: WorkerHandle, body: Bytes) -> impl Future<Output = i64> + Send;

    /// 已登录的连接每收到一个数据包调用一次。
    fn request(&self, conn: WorkerHandle, packet: Packet) -> impl Future<Output = ()> + Send;

    /// 连接结束时调用，每个连接只调用一次。
    fn quit(&self, connection_id: u32, session_id: i64) -> impl Future<Output = ()> + Send {
        async move {
            debug!(connection_id, session_id, "连接已退出");
        }
    }
}

/// 请求命令的参数。
#[derive(Clone, Debug)]
pub struct Invocation {
    pub connection_id: u32,
    pub session_id: i64,

    /// 命令名后面的部分，已去掉前导空白。
    pub args: Bytes,
}

/// 示例`Handler`。
///
/// 登录包的格式是`LOGIN <session-id>`；登录后每个数据包的第一个单词是命令名，
/// 命令通过`Dispatcher`查找，返回值会被写回给这个连接。
#[derive(Debug)]
pub struct Router {
    commands: Dispatcher<Invocation, Bytes>,
}

impl Router {
    /// 创建`Router`，注册`PING`、`ECHO`和`WHOAMI`。
    pub fn new() -> Router {
        let commands = Dispatcher::new();
        commands.bind("PING", |_: Invocation| Bytes::from_static(b"PONG"));
        commands.bind("ECHO", |inv: Invocation| inv.args);
        commands.bind("WHOAMI", |inv: Invocation| {
            Bytes::from(format!("{} {}", inv.connection_id, inv.session_id))
        });
        Router { commands }
    }

    /// 命令表，可以继续注册命令。
    pub fn commands(&self) -> &Dispatcher<Invocation, Bytes> {
        &self.commands
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

impl Handler for Router {
    async fn login(&self, conn: WorkerHandle, body: Bytes) -> i64 {
        let session_id = parse_login(&body).unwrap_or(0);
        if session_id > 0 {
            conn.cast(Bytes::from(format!("OK {session_id}")));
        } else {
            conn.cast(Bytes::from_static(b"ERR login required"));
        }
        session_id
    }

    async fn request(&self, conn: WorkerHandle, packet: Packet) {
        let (name, args) = split_command(&packet.body);
        let invocation = Invocation {
            connection_id: packet.connection_id,
            session_id: packet.session_id,
            args,
        };
        let reply = match self.commands.call(&name, invocation) {
            Ok(reply) => reply,
            Err(err) => Bytes::from(format!("ERR {err}")),
        };
        conn.cast(reply);
    }

    async fn quit(&self, connection_id: u32, session_id: i64) {
        info!(connection_id, session_id, "会话结束");
    }
}

/// 解析`LOGIN <session-id>`，返回会话 id。
fn parse_login(body: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(body).ok()?;
    let mut words = text.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("LOGIN") {
        return None;
    }
    words.next()?.parse().ok()
}

/// 将数据体拆分为大写的命令名和剩余的参数。
fn split_command(body: &Bytes) -> (String, Bytes) {
    let end = body
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let name = String::from_utf8_lossy(&body[..end]).to_ascii_uppercase();

    let start = body[end..]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|offset| end + offset)
        .unwrap_or(body.len());
    (name, body.slice(start..))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_login() {
        assert_eq!(parse_login(b"LOGIN 42"), Some(42));
        assert_eq!(parse_login(b"login   7 "), Some(7));
        assert_eq!(parse_login(b"LOGIN"), None);
        assert_eq!(parse_login(b"HELLO 1"), None);
        assert_eq!(parse_login(b"LOGIN abc"), None);
    }

    #[test]
    fn splits_command() {
        let (name, args) = split_command(&Bytes::from_static(b"echo  hello world"));
        assert_eq!(name, "ECHO");
        assert_eq!(&args[..], b"hello world");

        let (name, args) = split_command(&Bytes::from_static(b"PING"));
        assert_eq!(name, "PING");
        assert!(args.is_empty());
    }
}
