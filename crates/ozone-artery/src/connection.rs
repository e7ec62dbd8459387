use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ozone_core::{Frame, Intent};
use ozone_transport::LinkSender;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::ack::AckRegistry;
use crate::dispatch::DispatchChain;
use crate::error::SendError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live connection: the outbound half of a link plus the acks pending on it.
///
/// Dropping the last handle closes the underlying link and stops its read loop.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: String,
    sender: LinkSender,
    acks: AckRegistry,
    closed: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new(peer: impl Into<String>, sender: LinkSender) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            sender,
            acks: AckRegistry::default(),
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.sender.is_open()
    }

    /// Closes the link and abandons every pending ack wait.
    pub fn close(&self) {
        self.sender.close();
        self.closed.send_replace(true);
        self.acks.abandon_all();
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let text = frame.encode()?;
        self.sender.send(text)?;
        trace!(peer = %self.peer, intents = frame.payload().len(), "frame sent");
        Ok(())
    }

    pub fn send_intents(&self, payload: Vec<Intent>) -> Result<(), SendError> {
        self.send_frame(&Frame::intents(payload))
    }

    pub(crate) fn acks(&self) -> &AckRegistry {
        &self.acks
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Starts the read loop for `handle`; frames are dispatched one at a time.
pub(crate) fn spawn_inbound(
    handle: &Arc<ConnectionHandle>,
    inbound: mpsc::Receiver<String>,
    chain: Arc<DispatchChain>,
) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(handle);
    let closed = handle.closed_signal();
    tokio::spawn(run_inbound(weak, closed, inbound, chain))
}

async fn run_inbound(
    handle: Weak<ConnectionHandle>,
    mut closed: watch::Receiver<bool>,
    mut inbound: mpsc::Receiver<String>,
    chain: Arc<DispatchChain>,
) {
    loop {
        let text = tokio::select! {
            next = inbound.recv() => match next {
                Some(text) => text,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };
        let Some(connection) = handle.upgrade() else {
            break;
        };
        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %connection.peer(), %err, "dropping malformed frame");
                continue;
            }
        };
        chain.dispatch(&connection, &frame).await;
    }

    if let Some(connection) = handle.upgrade() {
        debug!(peer = %connection.peer(), id = connection.id(), "connection read loop ended");
        connection.close();
    }
}
