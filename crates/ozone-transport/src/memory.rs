//! In-process network used by tests and simulations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ozone_core::PeerDescriptor;
use tokio::sync::{mpsc, watch};

use crate::adapter::{link_pair, Acceptor, Connector, Link, TransportError};

const DEFAULT_LINK_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct MemoryPeer {
    accept_tx: Option<mpsc::UnboundedSender<Link>>,
    reachable: bool,
    gate: Option<watch::Receiver<bool>>,
    attempts: u64,
}

/// In-memory network of named listeners, dialed through [`Connector`].
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    local_name: String,
    capacity: usize,
    peers: Arc<Mutex<HashMap<String, MemoryPeer>>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new("core")
    }
}

impl MemoryNetwork {
    /// `local_name` is what listeners see as the dialer's peer name.
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            capacity: DEFAULT_LINK_CAPACITY,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Registers a reachable listener for `peer`, replacing any previous one.
    pub fn listen(&self, peer: &str) -> MemoryListener {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let mut peers = self.lock();
        let entry = peers.entry(peer.to_string()).or_default();
        entry.accept_tx = Some(accept_tx);
        entry.reachable = true;
        MemoryListener { rx: accept_rx }
    }

    /// Toggles whether dials to `peer` are refused.
    pub fn set_reachable(&self, peer: &str, reachable: bool) {
        self.lock().entry(peer.to_string()).or_default().reachable = reachable;
    }

    /// Makes subsequent dials to `peer` wait until the returned gate is released.
    pub fn hold(&self, peer: &str) -> ConnectGate {
        let (tx, rx) = watch::channel(false);
        self.lock().entry(peer.to_string()).or_default().gate = Some(rx);
        ConnectGate { tx }
    }

    /// Number of connection attempts made towards `peer`.
    pub fn attempts(&self, peer: &str) -> u64 {
        self.lock().get(peer).map_or(0, |p| p.attempts)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryPeer>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refused(peer: &PeerDescriptor, reason: &str) -> TransportError {
        TransportError::ConnectFailed {
            peer: peer.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, peer: &PeerDescriptor) -> Result<Link, TransportError> {
        let gate = {
            let mut peers = self.lock();
            let entry = peers.entry(peer.name.clone()).or_default();
            entry.attempts += 1;
            entry.gate.clone()
        };

        if let Some(mut gate) = gate {
            if gate.wait_for(|released| *released).await.is_err() {
                return Err(Self::refused(peer, "gate dropped"));
            }
        }

        let peers = self.lock();
        let Some(entry) = peers.get(&peer.name) else {
            return Err(Self::refused(peer, "no such host"));
        };
        if !entry.reachable {
            return Err(Self::refused(peer, "connection refused"));
        }
        let Some(accept_tx) = entry.accept_tx.as_ref() else {
            return Err(Self::refused(peer, "no listener"));
        };

        let (local, remote) = link_pair(&self.local_name, &peer.name, self.capacity);
        accept_tx
            .send(remote)
            .map_err(|_| Self::refused(peer, "listener closed"))?;
        Ok(local)
    }
}

/// Releases dials parked by [`MemoryNetwork::hold`].
#[derive(Debug)]
pub struct ConnectGate {
    tx: watch::Sender<bool>,
}

impl ConnectGate {
    pub fn release(&self) {
        self.tx.send_replace(true);
    }
}

/// Accept side of a [`MemoryNetwork`] listener.
#[derive(Debug)]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Link>,
}

#[async_trait]
impl Acceptor for MemoryListener {
    async fn accept(&mut self) -> Option<Link> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ozone_core::PeerDescriptor;

    use super::MemoryNetwork;
    use crate::adapter::{Acceptor, Connector, TransportError};

    #[tokio::test]
    async fn dial_reaches_listener() {
        let net = MemoryNetwork::new("core");
        let mut listener = net.listen("svc");

        let link = net
            .connect(&PeerDescriptor::new("svc", "svc"))
            .await
            .expect("connect");
        assert_eq!(link.peer(), "svc");

        let accepted = listener.accept().await.expect("accepted");
        assert_eq!(accepted.peer(), "core");
        assert_eq!(net.attempts("svc"), 1);
    }

    #[tokio::test]
    async fn unknown_and_unreachable_peers_fail() {
        let net = MemoryNetwork::default();
        let err = net
            .connect(&PeerDescriptor::new("ghost", "ghost"))
            .await
            .expect_err("no listener");
        assert!(err.is_connection_loss());

        let _listener = net.listen("svc");
        net.set_reachable("svc", false);
        let err = net
            .connect(&PeerDescriptor::new("svc", "svc"))
            .await
            .expect_err("refused");
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert_eq!(net.attempts("svc"), 1);
    }

    #[tokio::test]
    async fn held_dial_waits_for_release() {
        let net = MemoryNetwork::default();
        let _listener = net.listen("svc");
        let gate = net.hold("svc");

        let dialer = net.clone();
        let pending = tokio::spawn(async move {
            dialer.connect(&PeerDescriptor::new("svc", "svc")).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        gate.release();
        let link = pending.await.expect("join").expect("connect");
        assert_eq!(link.peer(), "svc");
    }
}
