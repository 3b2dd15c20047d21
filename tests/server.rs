use std::{net::SocketAddr, time::Duration};

use tinycells::{
    client::Client,
    config::{AppConfig, ServerConfig},
    server, Clients, Router,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time};

struct TestServer {
    addr: SocketAddr,
    clients: Clients<Router>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let config = AppConfig::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let clients = Clients::new(Router::new(), config.worker, config.clients);

    let (shutdown, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn({
        let clients = clients.clone();
        async move { server::run(listener, clients, &ServerConfig::default(), rx).await }
    });

    TestServer {
        addr,
        clients,
        shutdown,
        handle,
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn login_gates_requests() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await.unwrap();

    // 未登录时的数据包都被当作登录包。
    let reply = client.request("PING").await.unwrap();
    assert_eq!(&reply[..], b"ERR login required");

    let reply = client.login(42).await.unwrap();
    assert_eq!(&reply[..], b"OK 42");

    assert_eq!(&client.request("PING").await.unwrap()[..], b"PONG");
    assert_eq!(&client.request("echo hello world").await.unwrap()[..], b"hello world");

    let id = server.clients.ids()[0];
    let reply = client.request("WHOAMI").await.unwrap();
    assert_eq!(reply, format!("{id} 42").as_bytes());

    let reply = client.request("FLY").await.unwrap();
    assert!(reply.starts_with(b"ERR "));

    assert_eq!(server.clients.worker(id).unwrap().session_id(), 42);
}

#[tokio::test]
async fn third_failed_login_closes_connection() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await.unwrap();
    wait_until(|| server.clients.len() == 1).await;

    for _ in 0..3 {
        client.send("LOGIN nobody").await.unwrap();
    }

    // 最后一个回复可能来不及发送，连接关闭后不会再有任何数据。
    let mut replies = 0;
    while let Ok(Some(reply)) = client.read_packet().await {
        assert_eq!(&reply[..], b"ERR login required");
        replies += 1;
    }
    assert!(replies <= 3);

    wait_until(|| server.clients.is_empty()).await;
}

#[tokio::test]
async fn keep_alive_gets_no_reply() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await.unwrap();

    client.keep_alive().await.unwrap();
    client.login(7).await.unwrap();
    client.keep_alive().await.unwrap();

    // 保活包没有回复，下一个回复对应的是`PING`。
    assert_eq!(&client.request("PING").await.unwrap()[..], b"PONG");
}

#[tokio::test]
async fn force_close_is_idempotent() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await.unwrap();
    client.login(1).await.unwrap();

    let id = server.clients.ids()[0];
    assert!(server.clients.cast_to(id, "hello"));
    assert_eq!(&client.read_packet().await.unwrap().unwrap()[..], b"hello");

    assert!(server.clients.force_close(id).await);
    assert!(!server.clients.force_close(id).await);
    assert!(!server.clients.cast_to(id, "hello"));
    assert!(!server.clients.bind_session(id, 5));

    assert!(matches!(client.read_packet().await, Ok(None) | Err(_)));
}

#[tokio::test]
async fn cast_to_reaches_the_right_connection() {
    let server = start_server().await;
    let mut first = Client::connect(server.addr).await.unwrap();
    first.login(1).await.unwrap();
    let mut second = Client::connect(server.addr).await.unwrap();
    second.login(2).await.unwrap();

    let ids = server.clients.ids();
    assert_eq!(ids.len(), 2);
    let second_id = ids
        .iter()
        .copied()
        .find(|id| server.clients.worker(*id).unwrap().session_id() == 2)
        .unwrap();

    assert!(server.clients.cast_to(second_id, "only for you"));
    assert_eq!(
        &second.read_packet().await.unwrap().unwrap()[..],
        b"only for you"
    );
    assert_eq!(&first.request("PING").await.unwrap()[..], b"PONG");
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await.unwrap();
    client.login(3).await.unwrap();

    server.shutdown.send(()).unwrap();
    server.handle.await.unwrap();

    assert!(server.clients.is_empty());
    assert!(matches!(client.read_packet().await, Ok(None) | Err(_)));
}
