use std::time::Duration;

use spectre_lb::Node;
use spectre_transport::{DialError, dial};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn dial_reaches_listening_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"hi").await.unwrap();
    });

    let mut stream = dial(&Node::new("127.0.0.1", port), CONNECT_TIMEOUT)
        .await
        .unwrap();
    assert!(stream.nodelay().unwrap());

    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, b"hi");

    server.await.unwrap();
}

#[tokio::test]
async fn dial_reports_refused_backend() {
    let node = Node::new("127.0.0.1", unused_port().await);

    let err = dial(&node, CONNECT_TIMEOUT).await.unwrap_err();
    match &err {
        DialError::Connect { node: failed, .. } => assert_eq!(failed, &node),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains(&node.to_string()));
}

#[tokio::test]
async fn dial_resolves_hostnames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

    dial(&Node::new("localhost", port), CONNECT_TIMEOUT)
        .await
        .unwrap();
    accept.await.unwrap().unwrap();
}
