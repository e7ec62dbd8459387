use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use ozone_core::{Destination, Frame, OutboundEvent, PeerDescriptor};
use ozone_transport::Connector;
use serde_json::Value;
use tracing::{info, warn};

use crate::artery::{Artery, ArteryMap};
use crate::config::FabricConfig;
use crate::connection::ConnectionHandle;
use crate::delivery::Deliver;
use crate::dispatch::{Flow, HandlerId, InboundHandler};
use crate::error::FabricError;
use crate::heartbeat::HeartbeatDriver;
use crate::queue::{DrainReport, OutboundQueue};

/// Re-broadcasts every intent a peer sends to all other peers.
struct RelayHandler {
    origin: String,
    queue: Weak<OutboundQueue>,
}

#[async_trait]
impl InboundHandler for RelayHandler {
    async fn handle(&self, _connection: &Arc<ConnectionHandle>, frame: &Frame) -> Flow {
        let Some(queue) = self.queue.upgrade() else {
            return Flow::Continue;
        };
        let mut queued = 0;
        for intent in frame.payload() {
            info!(intent = %intent.intent, from = %self.origin, "received incoming event");
            queued += queue.push(
                Some(self.origin.as_str()),
                OutboundEvent::broadcast(intent.intent.clone(), intent.data.clone()),
            );
        }
        if queued > 0 {
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
        Flow::Continue
    }
}

/// The orchestrator's view of the network: one artery per peer, a shared
/// outbound queue, and the heartbeat that keeps arteries alive.
pub struct Fabric {
    arteries: Arc<ArteryMap>,
    queue: Arc<OutboundQueue>,
    config: FabricConfig,
    heartbeat: Mutex<Option<HeartbeatDriver>>,
}

impl Fabric {
    pub fn new(
        peers: impl IntoIterator<Item = PeerDescriptor>,
        connector: Arc<dyn Connector>,
        delivery: Arc<dyn Deliver>,
        config: FabricConfig,
    ) -> Result<Self, FabricError> {
        let arteries = Arc::new(ArteryMap::new(peers, connector)?);
        let queue = Arc::new(OutboundQueue::new(Arc::clone(&arteries), delivery));
        for artery in arteries.iter() {
            artery.chain().add_handler(Arc::new(RelayHandler {
                origin: artery.name().to_string(),
                queue: Arc::downgrade(&queue),
            }));
        }
        info!(peers = arteries.len(), "fabric configured");
        Ok(Self {
            arteries,
            queue,
            config,
            heartbeat: Mutex::new(None),
        })
    }

    pub fn arteries(&self) -> &Arc<ArteryMap> {
        &self.arteries
    }

    pub fn artery(&self, name: &str) -> Option<&Arc<Artery>> {
        self.arteries.get(name)
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Sends an intent from the core itself to every peer.
    pub async fn broadcast(&self, intent: impl Into<String>, data: Value) -> DrainReport {
        self.queue
            .enqueue(None, OutboundEvent::broadcast(intent, data))
            .await
    }

    pub async fn send_to(&self, peer: &str, intent: impl Into<String>, data: Value) -> DrainReport {
        self.queue
            .enqueue(None, OutboundEvent::new(intent, Destination::peer(peer), data))
            .await
    }

    /// Adds an inbound handler for frames from `peer`, after the relay.
    pub fn add_handler(&self, peer: &str, handler: Arc<dyn InboundHandler>) -> Option<HandlerId> {
        self.arteries
            .get(peer)
            .map(|artery| artery.chain().add_handler(handler))
    }

    /// Starts the heartbeat; a second call is a no-op.
    pub fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat_slot();
        if heartbeat.is_none() {
            *heartbeat = Some(HeartbeatDriver::spawn(
                Arc::clone(&self.queue),
                self.config.heartbeat_interval,
            ));
        }
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat_slot()
            .as_ref()
            .is_some_and(HeartbeatDriver::is_running)
    }

    /// Stops the heartbeat and closes every artery.
    pub fn shutdown(&self) {
        if let Some(driver) = self.heartbeat_slot().take() {
            driver.stop();
        }
        for artery in self.arteries.iter() {
            artery.close();
        }
        if !self.queue.is_empty() {
            warn!(pending = self.queue.len(), "shutting down with undelivered events");
        }
    }

    fn heartbeat_slot(&self) -> MutexGuard<'_, Option<HeartbeatDriver>> {
        self.heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
