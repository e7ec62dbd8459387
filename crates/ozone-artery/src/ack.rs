//! Request/reply acknowledgments layered over ordinary frames.
//!
//! A sender registers a waiter under a fresh [`AckToken`] before the frame
//! leaves; the receiving side answers with `{"ackReply": token}` and the
//! matching waiter resolves. Replies for unknown tokens are ignored.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use ozone_core::{AckToken, Frame, Intent};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::dispatch::{Flow, InboundHandler};
use crate::error::SendError;

/// Pending ack waiters of one connection.
#[derive(Debug, Default)]
pub(crate) struct AckRegistry {
    waiters: Mutex<HashMap<AckToken, oneshot::Sender<()>>>,
}

impl AckRegistry {
    fn register(&self, token: AckToken) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(token, tx);
        rx
    }

    fn forget(&self, token: &AckToken) {
        self.lock().remove(token);
    }

    /// Resolves the waiter for `token`, if any. Each waiter resolves once.
    pub(crate) fn resolve(&self, token: &AckToken) -> bool {
        match self.lock().remove(token) {
            Some(waiter) => {
                let _ = waiter.send(());
                true
            }
            None => false,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Drops every waiter; their [`AckWait`]s resolve to `false`.
    pub(crate) fn abandon_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AckToken, oneshot::Sender<()>>> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves to `true` when the matching reply arrives, `false` if the
/// connection was closed first.
#[derive(Debug)]
pub struct AckWait {
    token: AckToken,
    rx: oneshot::Receiver<()>,
}

impl AckWait {
    pub fn token(&self) -> &AckToken {
        &self.token
    }
}

impl Future for AckWait {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.is_ok())
    }
}

/// Sends `payload` with a fresh ack request and returns the pending wait.
///
/// The waiter is registered before the frame is written, so a reply can
/// never arrive unobserved.
pub fn request_ack(connection: &ConnectionHandle, payload: Vec<Intent>) -> Result<AckWait, SendError> {
    let token = AckToken::generate();
    let rx = connection.acks().register(token.clone());
    let frame = Frame::intents(payload).with_ack_request(token.clone());
    if let Err(err) = connection.send_frame(&frame) {
        connection.acks().forget(&token);
        return Err(err);
    }
    debug!(peer = %connection.peer(), %token, "ack requested");
    Ok(AckWait { token, rx })
}

/// Answers an ack request carried by `frame` and consumes ack replies.
///
/// Returns [`Flow::Stop`] for reply frames so later handlers never see them.
pub fn reply_if_requested(connection: &ConnectionHandle, frame: &Frame) -> Flow {
    if let Some(token) = frame.ack_request() {
        if let Err(err) = connection.send_frame(&Frame::ack_reply(token.clone())) {
            warn!(peer = %connection.peer(), %token, %err, "failed to send ack reply");
        }
    }

    match frame.ack_reply_token() {
        Some(token) => {
            if connection.acks().resolve(token) {
                debug!(peer = %connection.peer(), %token, "ack received");
            } else {
                debug!(peer = %connection.peer(), %token, "ignoring unmatched ack reply");
            }
            Flow::Stop
        }
        None => Flow::Continue,
    }
}

/// [`reply_if_requested`] as the first link of a dispatch chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckResponder;

#[async_trait]
impl InboundHandler for AckResponder {
    async fn handle(&self, connection: &Arc<ConnectionHandle>, frame: &Frame) -> Flow {
        reply_if_requested(connection, frame)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ozone_core::{AckToken, Frame, Intent};
    use ozone_transport::link_pair;
    use serde_json::json;

    use super::{reply_if_requested, request_ack};
    use crate::connection::ConnectionHandle;
    use crate::dispatch::Flow;

    struct Pair {
        core: ConnectionHandle,
        /// What the core receives.
        core_rx: tokio::sync::mpsc::Receiver<String>,
        svc: ConnectionHandle,
        /// What the service receives.
        svc_rx: tokio::sync::mpsc::Receiver<String>,
    }

    fn handle_pair() -> Pair {
        let (local, remote) = link_pair("core", "svc", 8);
        let (local_tx, core_rx) = local.into_parts();
        let (remote_tx, svc_rx) = remote.into_parts();
        Pair {
            core: ConnectionHandle::new("svc", local_tx),
            core_rx,
            svc: ConnectionHandle::new("core", remote_tx),
            svc_rx,
        }
    }

    #[tokio::test]
    async fn request_is_resolved_by_matching_reply_only() {
        let mut pair = handle_pair();
        let core = &pair.core;
        let wait = request_ack(core, vec![Intent::new("X", json!({}))]).expect("request");

        let sent = Frame::decode(&pair.svc_rx.recv().await.expect("frame")).expect("decode");
        assert_eq!(sent.ack_request(), Some(wait.token()));

        let unrelated = Frame::ack_reply(AckToken::generate());
        assert_eq!(reply_if_requested(core, &unrelated), Flow::Stop);
        assert_eq!(core.acks().pending(), 1);

        let matching = Frame::ack_reply(wait.token().clone());
        assert_eq!(reply_if_requested(core, &matching), Flow::Stop);
        assert!(wait.await);

        // A duplicate reply finds nothing left to resolve.
        assert_eq!(reply_if_requested(core, &matching), Flow::Stop);
        assert_eq!(core.acks().pending(), 0);
    }

    #[tokio::test]
    async fn receiver_replies_with_the_requested_token() {
        let mut pair = handle_pair();
        let token = AckToken::from("abc");
        let request =
            Frame::intents(vec![Intent::new("X", json!({}))]).with_ack_request(token.clone());

        assert_eq!(reply_if_requested(&pair.svc, &request), Flow::Continue);
        let reply = Frame::decode(&pair.core_rx.recv().await.expect("reply")).expect("decode");
        assert_eq!(reply.ack_reply_token(), Some(&token));
        assert!(reply.payload().is_empty());
    }

    #[tokio::test]
    async fn closing_the_connection_abandons_waits() {
        let pair = handle_pair();
        let wait = request_ack(&pair.core, vec![Intent::new("X", json!({}))]).expect("request");
        pair.core.close();
        let acked = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("resolves");
        assert!(!acked);
    }

    #[test]
    fn failed_send_leaves_no_waiter() {
        let pair = handle_pair();
        pair.core.close();
        assert!(request_ack(&pair.core, vec![Intent::new("X", json!({}))]).is_err());
        assert_eq!(pair.core.acks().pending(), 0);
    }
}
