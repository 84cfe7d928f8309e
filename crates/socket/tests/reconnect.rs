#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Loopback tests against a throwaway tungstenite server.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    cqlink_socket::{ConnectionState, Error, ResilientSocket, SocketConfig, SocketHandler},
    futures::{SinkExt, StreamExt},
    secrecy::Secret,
    tokio::{net::TcpListener, sync::mpsc},
    tokio_tungstenite::{
        accept_async, accept_hdr_async,
        tungstenite::{
            Message as WsMessage,
            handshake::server::{ErrorResponse, Request, Response},
        },
    },
};

const WAIT: Duration = Duration::from_secs(5);

/// Echo server. The first `drop_first` connections are closed right after
/// the handshake.
async fn echo_server(drop_first: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                if n < drop_first {
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, accepted)
}

struct Recorder {
    messages: mpsc::UnboundedSender<String>,
    connects: mpsc::UnboundedSender<()>,
    only_json: bool,
}

#[async_trait]
impl SocketHandler for Recorder {
    async fn on_connect(&self) {
        let _ = self.connects.send(());
    }

    async fn on_message(&self, payload: Vec<u8>) {
        let _ = self
            .messages
            .send(String::from_utf8_lossy(&payload).into_owned());
    }

    fn accepts(&self, payload: &[u8]) -> bool {
        !self.only_json || payload.first() == Some(&b'{')
    }
}

struct Harness {
    socket: ResilientSocket,
    messages: mpsc::UnboundedReceiver<String>,
    connects: mpsc::UnboundedReceiver<()>,
}

fn harness(addr: SocketAddr, only_json: bool) -> Harness {
    let (msg_tx, messages) = mpsc::unbounded_channel();
    let (conn_tx, connects) = mpsc::unbounded_channel();
    let mut config = SocketConfig::new("test", format!("ws://{addr}/"));
    config.reconnect_interval = Duration::from_millis(50);
    config.keepalive_interval = Duration::from_millis(200);
    let socket = ResilientSocket::new(
        config,
        Arc::new(Recorder {
            messages: msg_tx,
            connects: conn_tx,
            only_json,
        }),
    );
    Harness {
        socket,
        messages,
        connects,
    }
}

#[tokio::test]
async fn reconnects_after_peer_drop() {
    let (addr, accepted) = echo_server(1).await;
    let mut h = harness(addr, false);

    h.socket.start().await;
    tokio::time::timeout(WAIT, h.connects.recv()).await.unwrap();
    tokio::time::timeout(WAIT, h.connects.recv()).await.unwrap();

    assert!(h.socket.is_connected());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(h.socket.reconnect_count(), 1);

    h.socket.send_text("after").await.unwrap();
    let echoed = tokio::time::timeout(WAIT, h.messages.recv()).await.unwrap();
    assert_eq!(echoed.as_deref(), Some("after"));

    h.socket.close().await;
}

#[tokio::test]
async fn repeated_drops_each_reconnect_once() {
    let (addr, accepted) = echo_server(3).await;
    let mut h = harness(addr, false);

    h.socket.start().await;
    tokio::time::timeout(WAIT, h.connects.recv()).await.unwrap();

    let mut connects = 1;
    let mut saw_disconnected = false;
    tokio::time::timeout(WAIT, async {
        while connects < 4 {
            saw_disconnected |= !h.socket.is_connected();
            tokio::select! {
                Some(()) = h.connects.recv() => connects += 1,
                _ = tokio::time::sleep(Duration::from_millis(2)) => {},
            }
        }
    })
    .await
    .unwrap();

    assert!(saw_disconnected);
    assert!(h.socket.is_connected());
    assert_eq!(h.socket.reconnect_count(), 3);
    assert_eq!(accepted.load(Ordering::SeqCst), 4);

    h.socket.send_text("steady").await.unwrap();
    let echoed = tokio::time::timeout(WAIT, h.messages.recv()).await.unwrap();
    assert_eq!(echoed.as_deref(), Some("steady"));
    h.socket.close().await;
}

#[tokio::test]
async fn concurrent_connects_dial_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                let _ = ws.send(WsMessage::text(format!("hello-from-{n}"))).await;
                while ws.next().await.is_some() {}
            });
        }
    });

    let mut h = harness(addr, false);
    let (first, second) = tokio::join!(h.socket.connect(), h.socket.connect());
    assert!(first.is_ok());
    assert!(matches!(second, Err(Error::Connecting)));

    let hello = tokio::time::timeout(WAIT, h.messages.recv()).await.unwrap();
    assert_eq!(hello.as_deref(), Some("hello-from-0"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(h.messages.try_recv().is_err());

    h.socket.close().await;
}

#[tokio::test]
async fn close_during_retry_stays_closed() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let h = harness(addr, false);
    h.socket.start().await;
    assert_eq!(h.socket.state(), ConnectionState::Connecting);

    h.socket.close().await;
    assert_eq!(h.socket.state(), ConnectionState::Disconnected);

    h.socket.start().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.socket.state(), ConnectionState::Disconnected);
    assert_eq!(h.socket.reconnect_count(), 1);
}

#[tokio::test]
async fn start_retries_until_server_appears() {
    // Reserve a port, then free it so the first dial is refused.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let mut h = harness(addr, false);
    h.socket.start().await;
    assert_eq!(h.socket.state(), ConnectionState::Connecting);
    assert!(matches!(h.socket.send_text("x").await, Err(Error::NotConnected)));

    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        }
    });

    tokio::time::timeout(WAIT, h.connects.recv()).await.unwrap();
    assert!(h.socket.is_connected());
    h.socket.close().await;
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let h = harness(addr, false);
    assert!(matches!(h.socket.connect().await, Err(Error::Transport(_))));
    assert_eq!(h.socket.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn concurrent_sends_arrive_whole() {
    let (addr, _) = echo_server(0).await;
    let mut h = harness(addr, false);
    h.socket.connect().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let socket = h.socket.clone();
        tasks.push(tokio::spawn(async move {
            socket.send_text(format!("frame-{i:02}")).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 20 {
        let msg = tokio::time::timeout(WAIT, h.messages.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(msg);
    }
    received.sort();
    let expected: Vec<String> = (0..20).map(|i| format!("frame-{i:02}")).collect();
    assert_eq!(received, expected);

    h.socket.close().await;
}

#[tokio::test]
async fn filtered_frames_are_not_delivered() {
    let (addr, _) = echo_server(0).await;
    let mut h = harness(addr, true);
    h.socket.connect().await.unwrap();

    h.socket.send_text("plain").await.unwrap();
    h.socket.send_text("{\"ok\":true}").await.unwrap();

    let first = tokio::time::timeout(WAIT, h.messages.recv()).await.unwrap();
    assert_eq!(first.as_deref(), Some("{\"ok\":true}"));
    assert!(h.messages.try_recv().is_err());

    h.socket.close().await;
}

#[tokio::test]
async fn close_stops_the_socket() {
    let (addr, accepted) = echo_server(0).await;
    let h = harness(addr, false);
    h.socket.connect().await.unwrap();
    h.socket.close().await;

    assert_eq!(h.socket.state(), ConnectionState::Disconnected);
    assert!(matches!(h.socket.send_text("x").await, Err(Error::NotConnected)));
    assert!(matches!(h.socket.connect().await, Err(Error::Closed)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handshake_carries_configured_headers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (header_tx, mut header_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let value = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = header_tx.send(value);
            Ok(resp)
        };
        let mut ws = accept_hdr_async(stream, callback).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let config = SocketConfig::new("api", format!("ws://{addr}/api"))
        .with_header("Authorization", Secret::new("Token s3cret".into()));
    let socket = ResilientSocket::new(
        config,
        Arc::new(Recorder {
            messages: mpsc::unbounded_channel().0,
            connects: mpsc::unbounded_channel().0,
            only_json: false,
        }),
    );
    socket.connect().await.unwrap();

    let header = tokio::time::timeout(WAIT, header_rx.recv()).await.unwrap();
    assert_eq!(header.flatten().as_deref(), Some("Token s3cret"));
    socket.close().await;
}
