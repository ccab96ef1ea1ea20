//! Some nice utilities for writing automated tests for greeter servers and
//! clients running on the same tokio runtime.

use std::net::SocketAddr;

use greetq::{
    config,
    proto::{wire::Frame, HelloReply, HelloRequest, RpcStatus},
    Server, State,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{oneshot, watch},
    task::JoinHandle,
};

/// Config for a server listening on port "0", which lets the OS pick any
/// available TCP port. This is useful because tests are run in parallel and
/// we don't want socket addresses to collide, but we still want to know the
/// socket address.
pub fn listen_anywhere() -> config::Server {
    config::Server {
        listen: "127.0.0.1:0".parse().unwrap(),
        name: None,
    }
}

/// Starts a greeter server in the background and returns its actual address.
pub fn spawn_server() -> (SocketAddr, JoinHandle<()>) {
    let server = Server::init(listen_anywhere()).unwrap();
    let address = server.socket_address();

    let handle = tokio::task::spawn(async move { server.run().await.unwrap() });

    (address, handle)
}

/// Same as [`spawn_server`] but with a shutdown trigger and a subscription to
/// the server's state, so tests can stop it at a controlled point.
pub fn spawn_server_with_shutdown() -> (SocketAddr, impl FnOnce(), watch::Receiver<State>) {
    let (trigger, shutdown) = oneshot::channel::<()>();

    let server = Server::init(listen_anywhere())
        .unwrap()
        .shutdown_on(async move {
            let _ = shutdown.await;
        });

    let address = server.socket_address();
    let state = server.subscribe();

    tokio::task::spawn(async move { server.run().await.unwrap() });

    let shutdown = move || {
        let _ = trigger.send(());
    };

    (address, shutdown, state)
}

/// Attempts to connect to a TCP server that's running as a Tokio task for a
/// number of retries. Each failed attempt yields the execution back to the
/// runtime, allowing Tokio to progress pending tasks. If all the attempts
/// fail, the function panics and tests are stopped.
pub async fn ping_tcp_server(addr: SocketAddr) {
    let retries = 10;

    for _ in 0..retries {
        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                stream.shutdown().await.unwrap();
                return;
            }
            Err(_) => tokio::task::yield_now().await,
        }
    }

    panic!("Could not connect to server {addr}");
}

/// Sends a single request frame over a raw connection and returns the
/// correlated reply. This goes under the [`greetq::Client`] machinery on
/// purpose, so tests can assert on the exact bytes the server produces.
pub async fn send_hello(addr: SocketAddr, call_id: u64, name: &str) -> (RpcStatus, HelloReply) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = Frame::Request {
        call_id,
        request: HelloRequest {
            name: String::from(name),
        },
    };

    request.write_to(&mut stream).await.unwrap();

    match Frame::read_from(&mut stream).await.unwrap().unwrap() {
        Frame::Reply {
            call_id: replied_id,
            status,
            reply,
        } => {
            assert_eq!(replied_id, call_id);
            (status, reply)
        }
        other => panic!("expected a reply frame, got {other:?}"),
    }
}
