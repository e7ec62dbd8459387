use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ozone_core::PeerDescriptor;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to {peer} failed: {reason}")]
    ConnectFailed { peer: String, reason: String },
    #[error("link is closed")]
    Closed,
    #[error("outbound buffer is full")]
    QueueFull,
    #[error("payload exceeds max payload hint ({hint} bytes)")]
    PayloadTooLarge { hint: usize },
}

impl TransportError {
    /// Whether the failure means the peer is (currently) unreachable, as
    /// opposed to the link refusing this particular payload.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectFailed { .. } | TransportError::Closed
        )
    }
}

/// Dials peers. One call is one transport connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: &PeerDescriptor) -> Result<Link, TransportError>;
}

/// Yields links opened by remote dialers.
#[async_trait]
pub trait Acceptor: Send {
    /// Next accepted link, or `None` once the acceptor has shut down.
    async fn accept(&mut self) -> Option<Link>;
}

/// Cloneable outbound half of a link.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<String>,
    open: Arc<AtomicBool>,
    max_payload_hint: Option<usize>,
}

impl LinkSender {
    pub fn new(tx: mpsc::Sender<String>, open: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            open,
            max_payload_hint: None,
        }
    }

    pub fn with_payload_hint(mut self, hint: Option<usize>) -> Self {
        self.max_payload_hint = hint;
        self
    }

    /// Queues one text message for the link's writer. Never blocks.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if let Some(hint) = self.max_payload_hint {
            if text.len() > hint {
                return Err(TransportError::PayloadTooLarge { hint });
            }
        }
        self.tx.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Open until either side closes or the writer goes away.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

/// One established bidirectional text channel to a remote peer.
#[derive(Debug)]
pub struct Link {
    peer: String,
    sender: LinkSender,
    inbound: mpsc::Receiver<String>,
}

impl Link {
    pub fn new(peer: impl Into<String>, sender: LinkSender, inbound: mpsc::Receiver<String>) -> Self {
        Self {
            peer: peer.into(),
            sender,
            inbound,
        }
    }

    /// Name (or address) of the remote end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn sender(&self) -> &LinkSender {
        &self.sender
    }

    pub fn into_parts(self) -> (LinkSender, mpsc::Receiver<String>) {
        (self.sender, self.inbound)
    }
}

/// Creates two connected in-process link ends sharing one open flag.
///
/// The first link talks to `b`, the second to `a`.
pub fn link_pair(a: &str, b: &str, capacity: usize) -> (Link, Link) {
    let open = Arc::new(AtomicBool::new(true));
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        Link::new(b, LinkSender::new(a_tx, Arc::clone(&open)), a_rx),
        Link::new(a, LinkSender::new(b_tx, open), b_rx),
    )
}

#[cfg(test)]
mod tests {
    use super::{link_pair, TransportError};

    #[tokio::test]
    async fn link_pair_carries_text_both_ways() {
        let (left, right) = link_pair("core", "svc", 8);
        assert_eq!(left.peer(), "svc");
        assert_eq!(right.peer(), "core");

        let (left_tx, mut left_rx) = left.into_parts();
        let (right_tx, mut right_rx) = right.into_parts();
        left_tx.send("ping".to_string()).expect("send");
        right_tx.send("pong".to_string()).expect("send");

        assert_eq!(right_rx.recv().await.as_deref(), Some("ping"));
        assert_eq!(left_rx.recv().await.as_deref(), Some("pong"));
    }

    #[test]
    fn closing_one_end_closes_both() {
        let (left, right) = link_pair("core", "svc", 8);
        left.sender().close();
        assert!(!left.sender().is_open());
        assert_eq!(
            right.sender().send("x".to_string()),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn dropping_receiver_marks_sender_closed() {
        let (left, right) = link_pair("core", "svc", 8);
        let sender = left.sender().clone();
        drop(right);
        assert!(!sender.is_open());
    }

    #[test]
    fn full_buffer_and_payload_hint_are_reported() {
        let (left, _right) = link_pair("core", "svc", 1);
        let sender = left.sender().clone().with_payload_hint(Some(4));
        assert_eq!(
            sender.send("too long".to_string()),
            Err(TransportError::PayloadTooLarge { hint: 4 })
        );
        sender.send("ok".to_string()).expect("first send fits");
        assert_eq!(sender.send("no".to_string()), Err(TransportError::QueueFull));
    }

    #[test]
    fn connection_loss_classification() {
        assert!(TransportError::Closed.is_connection_loss());
        assert!(TransportError::ConnectFailed {
            peer: "a".into(),
            reason: "refused".into()
        }
        .is_connection_loss());
        assert!(!TransportError::QueueFull.is_connection_loss());
        assert!(!TransportError::PayloadTooLarge { hint: 1 }.is_connection_loss());
    }
}
