use tokio::sync::watch;

/// 侦听关闭信号。
///
/// `Shutdown`封装了一个`watch::Receiver<bool>`，值变为`true`或者发送端被丢弃的时候，
/// 视为收到了关闭信号。与广播不同，晚订阅的接收端也能看到已经发出的关闭信号。
#[derive(Debug)]
pub(crate) struct Shutdown {
    // 接收关闭信号。
    notify: watch::Receiver<bool>,

    // 如果接收到了关闭信号，这个值就为`true`。
    // 循环在每次开始的时候判断它，收到信号后当前这一轮做完再退出。
    is_shutdown: bool,
}

impl Shutdown {
    /// 封装接收端，返回创建的`Shutdown`。
    pub(crate) fn new(notify: watch::Receiver<bool>) -> Shutdown {
        let is_shutdown = *notify.borrow();
        Shutdown {
            notify,
            is_shutdown,
        }
    }

    /// 如果接收到了关闭信号，返回`true`。
    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// 等待接收关闭信号。
    /// 如果接收到关闭信号，设置`is_shutdown`字段为`true`。
    pub(crate) async fn recv(&mut self) {
        // 如果已经接受过关闭信号，直接返回
        if self.is_shutdown {
            return;
        }

        // 发送端被丢弃时`wait_for()`返回`Err`，同样视为关闭。
        let _ = self.notify.wait_for(|closed| *closed).await;

        self.is_shutdown = true;
    }
}
