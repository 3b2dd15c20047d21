pub mod client;

pub mod config;

pub mod logging;

mod shutdown;
use shutdown::Shutdown;

pub mod packet;
pub use packet::Packet;

pub mod connection;
pub use connection::Connection;

pub mod dispatch;
pub use dispatch::Dispatcher;

pub mod handler;
pub use handler::{Handler, Router};

mod worker;
pub use worker::WorkerHandle;

pub mod clients;
pub use clients::Clients;

pub mod server;

pub mod grace;
pub use grace::Grace;

pub mod queue;
pub use queue::{Backend, Queue, QueueError};

pub mod service;
pub use service::{Pool, Service};

/// 默认端口。
pub const DEFAULT_PORT: u16 = 6170;

/// 自定义的 Error，适配所有错误。
///
/// 各个模块有自己的错误枚举，跨模块的地方统一转换为它。
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// 自定义的 Result
///
/// 与我们自定义的 Error 一样，纯粹是为了方便。
pub type Result<T> = std::result::Result<T, Error>;
