//! Core Ozone primitives shared across crates.
//!
//! Includes peer descriptors, outbound event values, the JSON wire frame, and
//! base errors.

pub mod error;
pub mod frame;
pub mod types;

pub use error::CoreError;
pub use frame::{AckToken, Frame, Intent};
pub use types::{
    Destination, OutboundEvent, PeerDescriptor, DEFAULT_SOCKET_PORT, HEARTBEAT_INTENT, WILDCARD,
};
