//! Transport abstractions for Ozone.
//!
//! Arteries and service endpoints only depend on the text-oriented link,
//! connector and acceptor contracts defined in this crate.

pub mod adapter;
pub mod memory;

pub use adapter::{link_pair, Acceptor, Connector, Link, LinkSender, TransportError};
pub use memory::{ConnectGate, MemoryListener, MemoryNetwork};
