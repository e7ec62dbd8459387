use std::collections::HashSet;

use ozone_core::{CoreError, PeerDescriptor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid peer entry {entry:?}: {source}")]
    Invalid {
        entry: String,
        #[source]
        source: CoreError,
    },
    #[error("peer {0:?} is listed more than once")]
    Duplicate(String),
}

/// Builds the ordered peer registry from `name=host[:port]` entries.
pub fn parse_peers(entries: &[String]) -> Result<Vec<PeerDescriptor>, RegistryError> {
    let mut seen = HashSet::new();
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let peer: PeerDescriptor = entry.parse().map_err(|source| RegistryError::Invalid {
            entry: entry.clone(),
            source,
        })?;
        if !seen.insert(peer.name.clone()) {
            return Err(RegistryError::Duplicate(peer.name));
        }
        peers.push(peer);
    }
    Ok(peers)
}
