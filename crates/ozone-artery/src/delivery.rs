use std::sync::Arc;

use async_trait::async_trait;
use ozone_core::Frame;
use ozone_transport::TransportError;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::ack::request_ack;
use crate::artery::Artery;
use crate::config::DeliveryOptions;
use crate::connection::ConnectionHandle;
use crate::error::{DeliveryError, SendError};
use crate::queue::Batch;

/// Decides the fate of one batch.
///
/// `Ok(true)` consumes the batch, `Ok(false)` puts it back at the front of
/// the queue, and `Err` drops it with an error log.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, batch: &Batch, artery: &Arc<Artery>) -> Result<bool, DeliveryError>;
}

#[derive(Debug, Error)]
enum Undelivered {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("ack not received within {0:?}")]
    AckTimedOut(std::time::Duration),
    #[error("connection closed before ack")]
    AckAbandoned,
}

impl Undelivered {
    fn is_connection_loss(&self) -> bool {
        match self {
            Undelivered::Send(err) => err.is_connection_loss(),
            Undelivered::AckTimedOut(_) | Undelivered::AckAbandoned => true,
        }
    }

    /// The local outbound buffer is full; the connection itself is fine.
    fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Undelivered::Send(SendError::Transport(TransportError::QueueFull))
        )
    }
}

/// Delivery used by the orchestrator.
///
/// Heartbeats may open a connection; every other batch only uses an
/// existing one and waits in the queue otherwise. A lost connection is
/// discarded so the next heartbeat reconnects.
#[derive(Debug, Clone, Default)]
pub struct CoreDelivery {
    options: DeliveryOptions,
}

impl CoreDelivery {
    pub fn new(options: DeliveryOptions) -> Self {
        Self { options }
    }

    async fn send(&self, connection: &ConnectionHandle, batch: &Batch) -> Result<(), Undelivered> {
        let payload = batch.intents();
        if !self.options.wait_for_ack {
            connection.send_frame(&Frame::intents(payload))?;
            return Ok(());
        }

        let wait = request_ack(connection, payload)?;
        let acked = match self.options.ack_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Undelivered::AckTimedOut(limit))?,
            None => wait.await,
        };
        if acked {
            Ok(())
        } else {
            Err(Undelivered::AckAbandoned)
        }
    }
}

#[async_trait]
impl Deliver for CoreDelivery {
    async fn deliver(&self, batch: &Batch, artery: &Arc<Artery>) -> Result<bool, DeliveryError> {
        let heartbeat = batch.is_heartbeat();
        let connection = if heartbeat {
            artery.connection_or_establish().await
        } else {
            artery.connection_if_active().await
        };
        let Some(connection) = connection else {
            if !heartbeat {
                debug!(peer = %artery.name(), events = batch.len(), "no active artery, keeping batch queued");
            }
            return Ok(heartbeat);
        };

        match self.send(&connection, batch).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_backpressure() => {
                debug!(peer = %artery.name(), events = batch.len(), "outbound buffer full, keeping batch queued");
                Ok(heartbeat)
            }
            Err(err) if err.is_connection_loss() => {
                warn!(peer = %artery.name(), %err, "lost artery while sending");
                artery.discard_connection(&connection);
                Ok(heartbeat)
            }
            Err(err) => {
                error!(peer = %artery.name(), events = batch.len(), %err, "peer is reachable but the send failed");
                Ok(true)
            }
        }
    }
}
