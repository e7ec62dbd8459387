use ozone_core::CoreError;
use ozone_transport::TransportError;
use thiserror::Error;

/// Failure writing one frame to a connection.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("frame encode failed: {0}")]
    Codec(#[from] CoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SendError {
    pub fn is_connection_loss(&self) -> bool {
        match self {
            SendError::Codec(_) => false,
            SendError::Transport(err) => err.is_connection_loss(),
        }
    }
}

/// Raised by a Delivery Function that could not reach a verdict.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery to {peer} failed unexpectedly: {reason}")]
    Unexpected { peer: String, reason: String },
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("peer {0:?} is registered more than once")]
    DuplicatePeer(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no connection to the core")]
    NotConnected,
    #[error(transparent)]
    Send(#[from] SendError),
}

#[cfg(test)]
mod tests {
    use ozone_transport::TransportError;

    use super::{FabricError, SendError, ServiceError};

    #[test]
    fn send_error_classifies_transport_loss_only() {
        assert!(SendError::from(TransportError::Closed).is_connection_loss());
        assert!(!SendError::from(TransportError::QueueFull).is_connection_loss());
    }

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            FabricError::DuplicatePeer("a".to_string()).to_string(),
            "peer \"a\" is registered more than once"
        );
        assert_eq!(
            ServiceError::NotConnected.to_string(),
            "no connection to the core"
        );
    }
}
