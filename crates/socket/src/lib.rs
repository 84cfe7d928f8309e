//! Self-healing WebSocket client.
//!
//! A [`ResilientSocket`] owns one long-lived connection to a fixed URL. It
//! pings the peer on an interval, and any read or write failure schedules a
//! redial after a fixed delay. Exactly one reconnect cycle runs per broken
//! connection no matter how many tasks observe the failure.

mod error;

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{
        FutureExt, SinkExt, StreamExt,
        future::BoxFuture,
        stream::{SplitSink, SplitStream},
    },
    secrecy::{ExposeSecret, Secret},
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message as WsMessage,
            client::IntoClientRequest,
            http::{HeaderName, HeaderValue},
        },
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
};

pub use error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Static description of one socket.
#[derive(Clone)]
pub struct SocketConfig {
    /// Label used in logs.
    pub name: String,
    pub url: String,
    /// Extra handshake headers (credentials, so kept secret).
    pub headers: Vec<(String, Secret<String>)>,
    pub keepalive_interval: Duration,
    pub reconnect_interval: Duration,
}

impl SocketConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: Vec::new(),
            keepalive_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: Secret<String>) -> Self {
        self.headers.push((name.into(), value));
        self
    }
}

impl fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("SocketConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("headers", &header_names)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("reconnect_interval", &self.reconnect_interval)
            .finish()
    }
}

/// Callbacks invoked by the socket.
///
/// `on_message` runs in its own task per frame, so calls may overlap.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// A connection (first or re-established) is up.
    async fn on_connect(&self) {}

    async fn on_message(&self, payload: Vec<u8>);

    /// A connection attempt or an established connection failed.
    async fn on_error(&self, _error: &Error) {}

    /// Cheap pre-filter run on the read loop before a frame is delivered.
    fn accepts(&self, _payload: &[u8]) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

struct Link {
    state: ConnectionState,
    /// Bumped on every successful dial so stale failures are ignored.
    generation: u64,
    /// Cancels the read and keepalive tasks of the current connection.
    cancel: CancellationToken,
}

struct Inner {
    config: SocketConfig,
    handler: Arc<dyn SocketHandler>,
    link: Mutex<Link>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    shutdown: CancellationToken,
    reconnects: AtomicU64,
}

/// Cloneable handle to a self-healing WebSocket connection.
#[derive(Clone)]
pub struct ResilientSocket {
    inner: Arc<Inner>,
}

impl ResilientSocket {
    pub fn new(config: SocketConfig, handler: Arc<dyn SocketHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    cancel: CancellationToken::new(),
                }),
                writer: tokio::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of reconnect cycles started since creation.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    /// Single dial attempt. Does not retry on failure.
    ///
    /// Fails with [`Error::Connecting`] while another dial or a background
    /// retry cycle is in flight.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        {
            let mut link = self.inner.link();
            match link.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(Error::Connecting),
                ConnectionState::Closing => return Err(Error::Closed),
                ConnectionState::Disconnected => link.state = ConnectionState::Connecting,
            }
        }

        let result = self.inner.dial().await;
        if result.is_err() {
            let mut link = self.inner.link();
            if link.state == ConnectionState::Connecting {
                link.state = ConnectionState::Disconnected;
            }
        }
        result
    }

    /// Dial, and keep retrying in the background if the first attempt fails.
    pub async fn start(&self) {
        let error = match self.connect().await {
            Ok(()) | Err(Error::Closed | Error::Connecting) => return,
            Err(e) => e,
        };
        {
            let mut link = self.inner.link();
            if link.state != ConnectionState::Disconnected || self.inner.shutdown.is_cancelled() {
                return;
            }
            link.state = ConnectionState::Connecting;
        }
        warn!(
            socket = %self.name(),
            error = %error,
            "initial connect failed, retrying in background"
        );
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
        self.inner.handler.on_error(&error).await;
        tokio::spawn(Arc::clone(&self.inner).retry_loop());
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.inner.write(WsMessage::text(text.into())).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.inner.write(WsMessage::binary(data)).await
    }

    /// Stop for good: cancel background tasks and close the connection.
    pub async fn close(&self) {
        {
            let mut link = self.inner.link();
            link.state = ConnectionState::Closing;
            link.cancel.cancel();
        }
        self.inner.shutdown.cancel();

        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }

        self.inner.link().state = ConnectionState::Disconnected;
        info!(socket = %self.name(), "socket closed");
    }
}

impl fmt::Debug for ResilientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientSocket")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn dial(self: &Arc<Self>) -> Result<()> {
        let mut request = self.config.url.as_str().into_client_request()?;
        for (name, value) in &self.config.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value.expose_secret())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            request.headers_mut().insert(header, value);
        }

        debug!(socket = %self.config.name, url = %self.config.url, "dialing");
        let (stream, _response) = connect_async(request).await?;
        let (mut sink, reader) = stream.split();

        // The writer lock is held across the link update so a concurrent
        // write never sees the new generation with the old sink.
        let mut writer = self.writer.lock().await;
        let outcome = {
            let mut link = self.link();
            if self.shutdown.is_cancelled() || link.state == ConnectionState::Closing {
                Err(Error::Closed)
            } else if link.state == ConnectionState::Connected {
                Ok(None)
            } else {
                link.cancel.cancel();
                link.generation += 1;
                link.state = ConnectionState::Connected;
                link.cancel = self.shutdown.child_token();
                Ok(Some((link.generation, link.cancel.clone())))
            }
        };
        let (generation, cancel) = match outcome {
            Ok(Some(current)) => {
                *writer = Some(sink);
                current
            },
            Ok(None) => {
                drop(writer);
                debug!(socket = %self.config.name, "lost dial race, dropping duplicate connection");
                let _ = sink.close().await;
                return Ok(());
            },
            Err(e) => {
                drop(writer);
                let _ = sink.close().await;
                return Err(e);
            },
        };
        drop(writer);

        info!(socket = %self.config.name, url = %self.config.url, "socket connected");

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move { handler.on_connect().await });
        tokio::spawn(Arc::clone(self).read_loop(generation, cancel.clone(), reader));
        tokio::spawn(Arc::clone(self).keepalive_loop(cancel));
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        mut reader: WsReader,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => self.deliver(text.as_bytes().to_vec()),
                Some(Ok(WsMessage::Binary(data))) => self.deliver(data.to_vec()),
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!(socket = %self.config.name, "closed by peer");
                    self.fail(generation, &Error::Closed).await;
                    return;
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    self.fail(generation, &Error::Transport(e)).await;
                    return;
                },
            }
        }
    }

    fn deliver(&self, payload: Vec<u8>) {
        if !self.handler.accepts(&payload) {
            trace!(socket = %self.config.name, len = payload.len(), "frame filtered");
            return;
        }
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move { handler.on_message(payload).await });
    }

    async fn keepalive_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {},
            }
            if let Err(e) = self.write(WsMessage::Ping(Default::default())).await {
                debug!(socket = %self.config.name, error = %e, "keepalive ping failed");
                return;
            }
        }
    }

    async fn write(self: &Arc<Self>, message: WsMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let generation = {
            let link = self.link();
            if link.state != ConnectionState::Connected {
                return Err(Error::NotConnected);
            }
            link.generation
        };
        let Some(sink) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };

        if let Err(e) = sink.send(message).await {
            drop(writer);
            let error = Error::Transport(e);
            self.fail(generation, &error).await;
            return Err(error);
        }
        Ok(())
    }

    /// Report a failure of connection `generation` and schedule a reconnect
    /// unless another task already did.
    async fn fail(self: &Arc<Self>, generation: u64, error: &Error) {
        let won = {
            let mut link = self.link();
            let current = link.state == ConnectionState::Connected && link.generation == generation;
            if current {
                link.state = ConnectionState::Connecting;
                link.cancel.cancel();
            }
            current
        };
        if !won {
            return;
        }

        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        warn!(
            socket = %self.config.name,
            error = %error,
            delay_secs = self.config.reconnect_interval.as_secs_f64(),
            "socket broken, will reconnect after delay"
        );
        self.handler.on_error(error).await;
        tokio::spawn(Arc::clone(self).retry_loop());
    }

    /// Boxed because `dial` spawns the read loop, which can land back here
    /// through `fail`.
    fn retry_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.config.reconnect_interval) => {},
                }
                match self.dial().await {
                    Ok(()) | Err(Error::Closed) => return,
                    Err(e) => {
                        warn!(
                            socket = %self.config.name,
                            error = %e,
                            "reconnect attempt failed"
                        );
                        self.handler.on_error(&e).await;
                    },
                }
            }
        }
        .boxed()
    }
}
