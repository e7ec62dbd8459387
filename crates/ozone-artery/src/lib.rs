//! Ozone artery layer: per-peer connection management, the outbound event
//! queue, the acknowledgment protocol, and inbound dispatch.
//!
//! [`Fabric`](fabric::Fabric) wires these together for the orchestrator;
//! [`ServiceEndpoint`](service::ServiceEndpoint) is the peer-side counterpart.

pub mod ack;
pub mod artery;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod fabric;
pub mod heartbeat;
pub mod intents;
pub mod queue;
pub mod service;

pub use ack::{reply_if_requested, request_ack, AckResponder, AckWait};
pub use artery::{Artery, ArteryMap, ConnectionState};
pub use config::{DeliveryOptions, FabricConfig};
pub use connection::ConnectionHandle;
pub use delivery::{CoreDelivery, Deliver};
pub use dispatch::{handler_fn, DispatchChain, Flow, HandlerId, InboundHandler};
pub use error::{DeliveryError, FabricError, SendError, ServiceError};
pub use fabric::Fabric;
pub use heartbeat::HeartbeatDriver;
pub use intents::{IntentRouter, ListenerId};
pub use queue::{Batch, DrainReport, OutboundQueue};
pub use service::ServiceEndpoint;
