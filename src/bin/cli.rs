use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::{convert::Infallible, str};
use tinycells::{client::Client, DEFAULT_PORT};
use tokio::signal;
use tokio_stream::StreamExt;

#[derive(Parser, Debug)]
#[command(
    name = "tinycells-cli",
    version,
    author,
    about = "tinycells 服务器的命令行客户端"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
    #[arg(name = "hostname", long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// 登录用的会话 id。
    #[arg(long, default_value_t = 1)]
    session: i64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 登录后发送`PING`。
    Ping,
    /// 登录后发送一个数据包并打印响应。
    Send {
        // clap 从命令行自动获取的`&str`无法自动转换为`Bytes`，
        // 所以我们要提供一个解析器。
        #[arg(value_parser = bytes_from_str)]
        body: Bytes,
    },
    /// 登录后打印服务器发来的所有数据包，直到按下 Ctrl-C。
    Listen,
}

// `Infallible`表示永远不会错误
fn bytes_from_str(src: &str) -> Result<Bytes, Infallible> {
    Ok(Bytes::from(src.to_string()))
}

fn print_body(body: &[u8]) {
    if let Ok(string) = str::from_utf8(body) {
        println!("\"{}\"", string);
    } else {
        println!("{:?}", body);
    }
}

#[test]
fn verify_args() {
    use clap::CommandFactory;
    Args::command().debug_assert();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> tinycells::Result<()> {
    // 获取命令行参数。
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);
    // 连接服务端。
    let mut client = Client::connect(&addr).await?;

    let reply = client.login(args.session).await?;
    if !reply.starts_with(b"OK") {
        print_body(&reply);
        return Err("登录失败".into());
    }

    match args.command {
        Command::Ping => {
            let reply = client.request("PING").await?;
            print_body(&reply);
        }
        Command::Send { body } => {
            let reply = client.request(body).await?;
            print_body(&reply);
        }
        Command::Listen => {
            let packets = client.packets();
            tokio::pin!(packets);
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => return Ok(()),
                    maybe_body = packets.next() => match maybe_body {
                        Some(body) => print_body(&body?),
                        // 服务端关闭了。
                        None => {
                            println!("服务器已关闭");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
