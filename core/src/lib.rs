//! rfmesh core: AODV mesh routing and store-and-forward relaying for
//! HTTP-over-radio stations.
//!
//! The crate is radio-agnostic: callers plug in a [`LegacyTransport`] (and
//! optionally a [`HighThroughputTransport`]) and feed received frames into
//! [`MeshNetwork::handle_inbound`]. Everything above the modem lives here:
//! route discovery, relaying, queuing, beacons.

pub mod address;
pub mod mesh;
pub mod message;
pub mod routing;
pub mod transport;

use thiserror::Error;

pub use address::MeshAddress;
pub use mesh::{MeshNetwork, MeshNode, NetworkStats, NodeCapabilities};
pub use message::{MeshPacket, WireMessage};
pub use routing::{RouteEntry, Router};
pub use transport::{
    HighThroughputTransport, LegacyTransport, OfdmConfig, OfdmStats, TransmissionMode,
    TransmitReport,
};

#[derive(Debug, Error)]
pub enum MeshError {
    /// The underlying radio transport rejected or failed a transmission.
    #[error("transport error: {0}")]
    Transport(String),
    /// No transport is attached that can carry this frame.
    #[error("transport unavailable")]
    TransportUnavailable,
    /// A frame could not be encoded or decoded.
    #[error("serialization error")]
    Serialization,
}

/// Callback interface for events the application layer cares about.
pub trait MeshDelegate: Send + Sync {
    /// A packet addressed to this station arrived.
    fn on_packet_received(&self, packet: MeshPacket);
}

/// Current unix time in whole seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
