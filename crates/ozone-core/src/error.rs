use thiserror::Error;

/// Shared error type for core primitive operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Peer registry entry that cannot be turned into a descriptor.
    #[error("invalid peer entry: {0:?}")]
    InvalidPeer(String),
    /// Peer name that collides with protocol syntax.
    #[error("peer name {0:?} is reserved")]
    ReservedName(String),
    /// Frame encode/decode failure.
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
