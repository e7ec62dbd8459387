use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("shared secret {path} could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("shared secret {0} is empty")]
    Empty(PathBuf),
}

/// Reads the shared secret forwarded to peers during the handshake.
///
/// A missing or empty secret is only an error when `required`.
pub fn load_secret(path: &Path, required: bool) -> Result<Option<String>, SecretError> {
    debug!("attempting to load secret from {}", path.display());
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(source) if required => {
            return Err(SecretError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(err) => {
            warn!("no shared secret at {} ({err}), dialing without one", path.display());
            return Ok(None);
        }
    };

    let secret = raw.trim();
    if secret.is_empty() {
        if required {
            return Err(SecretError::Empty(path.to_path_buf()));
        }
        warn!("shared secret at {} is empty, dialing without one", path.display());
        return Ok(None);
    }
    debug!("secret was successfully loaded");
    Ok(Some(secret.to_string()))
}
