//! Wire messages: everything that crosses the radio link
//!
//! All envelopes are JSON with a `type` tag so the receiving side can
//! dispatch without peeking at payload internals. Application payloads ride
//! inside `MeshPacket` as opaque bytes; the routing layer never inspects
//! them.

use crate::address::MeshAddress;
use crate::mesh::node::NodeCapabilities;
use crate::unix_now;
use serde::{Deserialize, Serialize};

/// Hop budget every freshly originated packet starts with.
pub const PACKET_TTL: u8 = 10;

/// An application packet plus the routing metadata the relay engine needs.
///
/// `ttl` strictly decreases per relay hop; a packet arriving with `ttl <= 0`
/// is dropped, never forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPacket {
    /// Originating station
    pub source: MeshAddress,
    /// Final destination
    pub destination: MeshAddress,
    /// Remaining hop budget
    pub ttl: u8,
    /// Hops traversed so far
    pub hop_count: u8,
    /// Unique per origination (UUID v4)
    pub message_id: String,
    /// Whether the destination should send an ACK back to the source
    pub ack_required: bool,
    /// Opaque application bytes (method/headers/body: not ours to parse)
    pub payload: Vec<u8>,
    /// Unix timestamp (seconds) at origination
    pub timestamp: u64,
}

impl MeshPacket {
    /// Wrap an application payload for transmission.
    pub fn new(source: MeshAddress, destination: MeshAddress, payload: Vec<u8>) -> Self {
        Self {
            source,
            destination,
            ttl: PACKET_TTL,
            hop_count: 0,
            message_id: uuid::Uuid::new_v4().to_string(),
            ack_required: true,
            payload,
            timestamp: unix_now(),
        }
    }
}

/// AODV route request: broadcast when no route to a destination is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub source: MeshAddress,
    pub destination: MeshAddress,
    /// Originator's sequence number at the time of the request
    pub sequence_number: u64,
    /// Hops this request has traveled from the originator
    pub hop_count: u8,
    /// Dedup key: a node processes a given request exactly once
    pub message_id: String,
    pub timestamp: u64,
}

/// AODV route reply: unicast back toward the requester.
///
/// `source` is the station the route leads to; `destination` is the
/// original requester the reply travels toward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteReply {
    pub source: MeshAddress,
    pub destination: MeshAddress,
    pub sequence_number: u64,
    /// Hops between the replying node and `source`
    pub hop_count: u8,
    /// How long the advertised route should be considered valid (seconds)
    pub lifetime: u64,
    pub message_id: String,
}

/// AODV route error: tells neighbors these destinations are gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteError {
    pub unreachable_destinations: Vec<MeshAddress>,
    pub source: MeshAddress,
}

/// Periodic capability announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub callsign: String,
    pub address: MeshAddress,
    pub capabilities: NodeCapabilities,
    pub timestamp: u64,
}

/// Delivery acknowledgement for an `ack_required` packet.
///
/// Travels hop by hop back toward `destination` (the packet's originator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: String,
    pub source: MeshAddress,
    pub destination: MeshAddress,
    pub timestamp: u64,
}

/// Everything that can arrive from the transport, tagged for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    RouteRequest(RouteRequest),
    RouteReply(RouteReply),
    RouteError(RouteError),
    Data(MeshPacket),
    Beacon(Beacon),
    Ack(Ack),
}

impl WireMessage {
    /// Serialize for the wire. Infallible for these types in practice; an
    /// encoding failure yields an empty envelope the receiver will discard.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse an inbound envelope. `None` for malformed input: expected
    /// under broadcast semantics, not an error.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
