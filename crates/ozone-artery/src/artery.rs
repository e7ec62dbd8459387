//! Per-peer connection slots.
//!
//! An [`Artery`] owns at most one connection to its peer. Concurrent callers
//! share a single in-flight attempt; an attempt started before a
//! [`discard`](Artery::discard) can never overwrite the slot afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use ozone_core::PeerDescriptor;
use ozone_transport::Connector;
use tracing::{debug, error, info, warn};

use crate::connection::{spawn_inbound, ConnectionHandle};
use crate::dispatch::DispatchChain;
use crate::error::FabricError;

type PendingAttempt = Shared<BoxFuture<'static, Option<Arc<ConnectionHandle>>>>;

enum Slot {
    Idle,
    Connecting {
        generation: u64,
        attempt: PendingAttempt,
    },
    Ready(Arc<ConnectionHandle>),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Open,
    Failed,
}

pub struct Artery {
    peer: PeerDescriptor,
    connector: Arc<dyn Connector>,
    chain: Arc<DispatchChain>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

impl fmt::Debug for Artery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artery")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Artery {
    /// New artery whose inbound chain starts with the ack responder.
    pub fn new(peer: PeerDescriptor, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            connector,
            chain: Arc::new(DispatchChain::with_ack_responder()),
            slot: Mutex::new(Slot::Idle),
            generation: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.peer.name
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    /// Inbound handlers run for every frame this peer sends.
    pub fn chain(&self) -> &Arc<DispatchChain> {
        &self.chain
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.lock() {
            Slot::Idle => ConnectionState::Unconnected,
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Ready(handle) if handle.is_open() => ConnectionState::Open,
            Slot::Ready(_) => ConnectionState::Unconnected,
            Slot::Failed => ConnectionState::Failed,
        }
    }

    /// The open connection, waiting on an in-flight attempt if there is one.
    /// Never starts an attempt.
    pub async fn connection_if_active(&self) -> Option<Arc<ConnectionHandle>> {
        let attempt = match &*self.lock() {
            Slot::Ready(handle) => return handle.is_open().then(|| Arc::clone(handle)),
            Slot::Connecting { attempt, .. } => attempt.clone(),
            Slot::Idle | Slot::Failed => return None,
        };
        attempt.await.filter(|handle| handle.is_open())
    }

    /// The open connection, starting an attempt when there is neither an
    /// open connection nor an attempt already in flight.
    pub async fn connection_or_establish(self: &Arc<Self>) -> Option<Arc<ConnectionHandle>> {
        let attempt = {
            let mut slot = self.lock();
            match &*slot {
                Slot::Ready(handle) if handle.is_open() => return Some(Arc::clone(handle)),
                Slot::Connecting { attempt, .. } => attempt.clone(),
                Slot::Ready(_) | Slot::Idle | Slot::Failed => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let attempt = self.start_attempt(generation);
                    *slot = Slot::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Closes the current connection (if any) and forgets any in-flight
    /// attempt. The next heartbeat establishes a fresh one.
    pub fn discard(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Slot::Idle);
        if let Slot::Ready(handle) = previous {
            handle.close();
        }
        warn!(peer = %self.peer.name, "artery discarded, will attempt to reconnect on next heartbeat");
    }

    /// Discards only if the slot still holds `connection`; a newer attempt or
    /// handle is left alone. The stale handle is closed either way.
    pub fn discard_connection(&self, connection: &ConnectionHandle) {
        let stale = {
            let mut slot = self.lock();
            match &*slot {
                Slot::Ready(current) if current.id() == connection.id() => {
                    *slot = Slot::Idle;
                    true
                }
                _ => false,
            }
        };
        connection.close();
        if stale {
            warn!(peer = %self.peer.name, "artery discarded, will attempt to reconnect on next heartbeat");
        } else {
            debug!(peer = %self.peer.name, id = connection.id(), "stale connection closed, slot already moved on");
        }
    }

    /// Closes the connection and forgets any attempt without scheduling a
    /// reconnect. Used on shutdown.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Slot::Idle);
        if let Slot::Ready(handle) = previous {
            handle.close();
        }
        debug!(peer = %self.peer.name, "artery closed");
    }

    fn start_attempt(self: &Arc<Self>, generation: u64) -> PendingAttempt {
        let artery = Arc::clone(self);
        let task = tokio::spawn(async move { artery.establish(generation).await });
        async move { task.await.ok().flatten() }.boxed().shared()
    }

    async fn establish(self: Arc<Self>, generation: u64) -> Option<Arc<ConnectionHandle>> {
        debug!(peer = %self.peer.name, address = %self.peer.address, "attempting to connect artery");
        match self.connector.connect(&self.peer).await {
            Ok(link) => {
                let (sender, inbound) = link.into_parts();
                let handle = Arc::new(ConnectionHandle::new(self.peer.name.clone(), sender));
                spawn_inbound(&handle, inbound, Arc::clone(&self.chain));
                info!(peer = %self.peer.name, "artery is now active");
                self.settle(generation, Slot::Ready(Arc::clone(&handle)));
                Some(handle)
            }
            Err(err) => {
                error!(
                    peer = %self.peer.name,
                    %err,
                    "artery could not be established, will reattempt on next heartbeat"
                );
                self.settle(generation, Slot::Failed);
                None
            }
        }
    }

    /// Stores an attempt's outcome unless the attempt has been superseded.
    fn settle(&self, generation: u64, outcome: Slot) {
        let mut slot = self.lock();
        match &*slot {
            Slot::Connecting { generation: current, .. } if *current == generation => {
                *slot = outcome;
            }
            _ => debug!(peer = %self.peer.name, generation, "ignoring superseded connection attempt"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The configured arteries, in registration order.
#[derive(Debug, Default)]
pub struct ArteryMap {
    arteries: Vec<Arc<Artery>>,
    index: HashMap<String, usize>,
}

impl ArteryMap {
    pub fn new(
        peers: impl IntoIterator<Item = PeerDescriptor>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, FabricError> {
        let mut map = Self::default();
        for peer in peers {
            if map.index.contains_key(&peer.name) {
                return Err(FabricError::DuplicatePeer(peer.name));
            }
            map.index.insert(peer.name.clone(), map.arteries.len());
            map.arteries.push(Artery::new(peer, Arc::clone(&connector)));
        }
        Ok(map)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Artery>> {
        self.index.get(name).map(|&i| &self.arteries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Artery>> {
        self.arteries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.arteries.iter().map(|artery| artery.name())
    }

    pub fn len(&self) -> usize {
        self.arteries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arteries.is_empty()
    }
}
