//! WebSocket transport for Ozone.
//!
//! The core dials services with [`WebSocketConnector`]; services accept the
//! upgrade handshake with [`WebSocketListener`]. Each established socket is
//! driven by one pump task that moves text messages between the socket and the
//! [`Link`] channels handed to the caller.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ozone_core::{PeerDescriptor, DEFAULT_SOCKET_PORT};
use ozone_transport::{Acceptor, Connector, Link, LinkSender, TransportError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Handshake header carrying the shared secret from the core.
pub const SECRET_HEADER: &str = "x-ozone-secret";

#[derive(Debug, Clone)]
pub struct WebSocketConnectorConfig {
    /// Port used for peers whose address has none.
    pub default_port: u16,
    /// Shared secret forwarded in the handshake, if any.
    pub secret: Option<String>,
    pub connect_timeout: Duration,
    pub link_capacity: usize,
    pub max_payload_hint: Option<usize>,
}

impl Default for WebSocketConnectorConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_SOCKET_PORT,
            secret: None,
            connect_timeout: Duration::from_secs(10),
            link_capacity: 1024,
            max_payload_hint: None,
        }
    }
}

impl WebSocketConnectorConfig {
    pub fn url_for(&self, peer: &PeerDescriptor) -> String {
        format!("ws://{}", peer.authority(self.default_port))
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketListenerConfig {
    pub bind_addr: String,
    pub link_capacity: usize,
    pub accept_backlog: usize,
    pub max_payload_hint: Option<usize>,
}

impl WebSocketListenerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            link_capacity: 1024,
            accept_backlog: 16,
            max_payload_hint: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebSocketTransportError {
    #[error("server bind failed: {0}")]
    BindFailed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebSocketMetrics {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub handshakes_accepted: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_errors: u64,
}

#[derive(Debug, Default)]
struct WebSocketMetricsInner {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    handshakes_accepted: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
}

impl WebSocketMetricsInner {
    fn snapshot(&self) -> WebSocketMetrics {
        WebSocketMetrics {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            handshakes_accepted: self.handshakes_accepted.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Dials `ws://host:port` for each connection attempt.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConnectorConfig,
    metrics: Arc<WebSocketMetricsInner>,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConnectorConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(WebSocketMetricsInner::default()),
        }
    }

    pub fn metrics_snapshot(&self) -> WebSocketMetrics {
        self.metrics.snapshot()
    }

    fn build_request(&self, url: &str) -> Result<Request, String> {
        let mut request = url.into_client_request().map_err(|err| err.to_string())?;
        if let Some(secret) = &self.config.secret {
            let value = HeaderValue::from_str(secret).map_err(|err| err.to_string())?;
            request.headers_mut().insert(SECRET_HEADER, value);
        }
        Ok(request)
    }

    fn failed(&self, peer: &PeerDescriptor, reason: String) -> TransportError {
        self.metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
        TransportError::ConnectFailed {
            peer: peer.name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, peer: &PeerDescriptor) -> Result<Link, TransportError> {
        self.metrics.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let url = self.config.url_for(peer);
        debug!(peer = %peer.name, %url, "dialing websocket");

        let request = self
            .build_request(&url)
            .map_err(|reason| self.failed(peer, reason))?;

        let stream =
            match tokio::time::timeout(self.config.connect_timeout, connect_async(request)).await {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(err)) => return Err(self.failed(peer, err.to_string())),
                Err(_) => return Err(self.failed(peer, "handshake timed out".to_string())),
            };

        Ok(spawn_link(
            peer.name.clone(),
            stream,
            self.config.link_capacity,
            self.config.max_payload_hint,
            Arc::clone(&self.metrics),
        ))
    }
}

/// Accepts websocket upgrades on a TCP port.
pub struct WebSocketListener {
    local_addr: SocketAddr,
    accepted_rx: mpsc::Receiver<Link>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    metrics: Arc<WebSocketMetricsInner>,
}

impl WebSocketListener {
    pub async fn bind(config: WebSocketListenerConfig) -> Result<Self, WebSocketTransportError> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|err| {
            error!(
                "websocket server bind failed on {}: {}",
                config.bind_addr, err
            );
            WebSocketTransportError::BindFailed(err.to_string())
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| WebSocketTransportError::BindFailed(err.to_string()))?;
        info!(%local_addr, "websocket listener ready");

        let (accepted_tx, accepted_rx) = mpsc::channel(config.accept_backlog);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let metrics = Arc::new(WebSocketMetricsInner::default());
        tokio::spawn(run_accept_loop(
            listener,
            config,
            accepted_tx,
            shutdown_rx,
            Arc::clone(&metrics),
        ));

        Ok(Self {
            local_addr,
            accepted_rx,
            shutdown_tx: Some(shutdown_tx),
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics_snapshot(&self) -> WebSocketMetrics {
        self.metrics.snapshot()
    }
}

impl Drop for WebSocketListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl Acceptor for WebSocketListener {
    async fn accept(&mut self) -> Option<Link> {
        self.accepted_rx.recv().await
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    config: WebSocketListenerConfig,
    accepted_tx: mpsc::Sender<Link>,
    mut shutdown_rx: oneshot::Receiver<()>,
    metrics: Arc<WebSocketMetricsInner>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            maybe_conn = listener.accept() => {
                let (stream, addr) = match maybe_conn {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("websocket server: accept failed: {}", err);
                        continue;
                    }
                };
                let accepted_tx = accepted_tx.clone();
                let metrics = Arc::clone(&metrics);
                let capacity = config.link_capacity;
                let hint = config.max_payload_hint;
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws_stream) => {
                            info!("websocket server: handshake successful for {}", addr);
                            metrics.handshakes_accepted.fetch_add(1, Ordering::Relaxed);
                            let link = spawn_link(addr.to_string(), ws_stream, capacity, hint, metrics);
                            if accepted_tx.send(link).await.is_err() {
                                debug!("websocket server: listener gone, dropping {}", addr);
                            }
                        }
                        Err(err) => {
                            error!("websocket server: handshake failed for {}: {}", addr, err);
                        }
                    }
                });
            }
        }
    }
}

fn spawn_link<S>(
    peer: String,
    stream: WebSocketStream<S>,
    capacity: usize,
    max_payload_hint: Option<usize>,
    metrics: Arc<WebSocketMetricsInner>,
) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let open = Arc::new(AtomicBool::new(true));
    tokio::spawn(run_link_pump(
        peer.clone(),
        stream,
        outbound_rx,
        inbound_tx,
        Arc::clone(&open),
        metrics,
    ));
    Link::new(
        peer,
        LinkSender::new(outbound_tx, open).with_payload_hint(max_payload_hint),
        inbound_rx,
    )
}

async fn run_link_pump<S>(
    peer: String,
    stream: WebSocketStream<S>,
    mut outbound_rx: mpsc::Receiver<String>,
    inbound_tx: mpsc::Sender<String>,
    open: Arc<AtomicBool>,
    metrics: Arc<WebSocketMetricsInner>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            maybe_out = outbound_rx.recv() => {
                match maybe_out {
                    Some(text) => {
                        if write.send(Message::Text(text)).await.is_err() {
                            metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        // Every sender is gone; close politely.
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            maybe_in = read.next() => {
                match maybe_in {
                    Some(Ok(Message::Text(text))) => {
                        metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                        if inbound_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                            if inbound_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!(%peer, "dropping non-utf8 binary message"),
                    },
                    Some(Ok(Message::Close(_))) => {
                        info!(%peer, "websocket closed by remote");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%peer, "websocket read error: {}", err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    open.store(false, Ordering::Relaxed);
    debug!(%peer, "websocket pump stopped");
}

#[cfg(test)]
mod tests {
    use ozone_core::PeerDescriptor;

    use super::{WebSocketConnector, WebSocketConnectorConfig, SECRET_HEADER};

    #[test]
    fn url_uses_default_port_for_bare_hosts() {
        let cfg = WebSocketConnectorConfig {
            default_port: 1122,
            ..WebSocketConnectorConfig::default()
        };
        assert_eq!(
            cfg.url_for(&PeerDescriptor::new("billing", "billing")),
            "ws://billing:1122"
        );
        assert_eq!(
            cfg.url_for(&PeerDescriptor::new("local", "127.0.0.1:9000")),
            "ws://127.0.0.1:9000"
        );
    }

    #[test]
    fn request_carries_secret_header_when_configured() {
        let connector = WebSocketConnector::new(WebSocketConnectorConfig {
            secret: Some("s3cret".to_string()),
            ..WebSocketConnectorConfig::default()
        });
        let request = connector
            .build_request("ws://127.0.0.1:1122")
            .expect("request");
        assert_eq!(
            request
                .headers()
                .get(SECRET_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("s3cret")
        );

        let plain = WebSocketConnector::default()
            .build_request("ws://127.0.0.1:1122")
            .expect("request");
        assert!(plain.headers().get(SECRET_HEADER).is_none());
    }
}
