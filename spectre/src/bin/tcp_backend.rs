use std::net::SocketAddr;

use clap::Parser;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

#[derive(Parser)]
#[command(version, about = "Tagged TCP echo backend for spectre")]
struct Cli {
    #[arg(long, default_value_t = 8090)]
    port: u16,

    /// Sent as the first line of every connection
    #[arg(long)]
    name: Option<String>,
}

async fn handle_connection(mut stream: TcpStream, greeting: String) -> std::io::Result<()> {
    stream.write_all(greeting.as_bytes()).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write_all(&buf[..n]).await?;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let addr: SocketAddr = format!("127.0.0.1:{}", cli.port).parse()?;
    let name = cli.name.unwrap_or_else(|| format!("backend-{}", cli.port));

    let listener = TcpListener::bind(addr).await?;
    println!("TCP backend {} listening on {}", name, addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let greeting = format!("{}\n", name);

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, greeting).await {
                eprintln!("connection {} failed: {}", peer, err);
            }
        });
    }
}
