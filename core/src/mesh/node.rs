//! Station descriptors: who is on the mesh and what they can do

use crate::address::MeshAddress;
use crate::transport::{OfdmStats, TransmissionMode};
use serde::{Deserialize, Serialize};

/// Remote nodes unheard for this long are evicted (seconds).
pub const NODE_TIMEOUT_SECS: u64 = 600;

/// What a station offers the mesh. Carried in beacons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Willing to forward other stations' packets
    pub relay: bool,
    /// Willing to hold packets for unreachable destinations
    pub store: bool,
    /// Bridges to another network (e.g. internet gateway)
    pub gateway: bool,
    /// Modulation modes this station can receive
    pub supported_modes: Vec<TransmissionMode>,
    /// OFDM carrier count, 0 when OFDM is unsupported
    pub ofdm_carriers: usize,
    /// OFDM bandwidth in Hz, 0 when OFDM is unsupported
    pub ofdm_bandwidth_hz: u32,
}

impl NodeCapabilities {
    /// Relay+store station with legacy modulation only.
    pub fn basic() -> Self {
        Self {
            relay: true,
            store: true,
            gateway: false,
            supported_modes: vec![TransmissionMode::Qpsk],
            ofdm_carriers: 0,
            ofdm_bandwidth_hz: 0,
        }
    }

    pub fn ofdm_capable(&self) -> bool {
        self.supported_modes.contains(&TransmissionMode::Ofdm)
    }
}

/// Per-station traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub packets_relayed: u64,
    pub packets_dropped: u64,
    pub bytes_transferred: u64,
    /// Unix seconds when the station came up (uptime = now - started_at)
    pub started_at: u64,
    pub ofdm_frames_sent: u64,
    pub ofdm_frame_errors: u64,
}

/// A station on the mesh: the local one or a remote one heard via beacons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshNode {
    pub callsign: String,
    pub address: MeshAddress,
    /// Unix seconds this station was last heard
    pub last_seen: u64,
    /// Last measured received signal strength (dBm)
    pub signal_strength: f64,
    /// Last measured signal-to-noise ratio (dB)
    pub snr: f64,
    /// Estimated hops to reach this station (0 for the local node)
    pub hop_distance: u8,
    pub capabilities: NodeCapabilities,
    pub metrics: NodeMetrics,
}

impl MeshNode {
    /// Descriptor for the local station.
    pub fn local(callsign: &str, capabilities: NodeCapabilities, now: u64) -> Self {
        Self {
            callsign: callsign.trim().to_ascii_uppercase(),
            address: MeshAddress::from_callsign(callsign),
            last_seen: now,
            signal_strength: 0.0,
            snr: 0.0,
            hop_distance: 0,
            capabilities,
            metrics: NodeMetrics {
                started_at: now,
                ..NodeMetrics::default()
            },
        }
    }

    /// Whether this remote station should be evicted at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) >= NODE_TIMEOUT_SECS
    }
}

/// Network-wide observable state, the only user-facing output of the core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub node_count: usize,
    pub route_count: usize,
    pub stored_packets: usize,
    pub retry_pending: usize,
    pub packets_relayed: u64,
    pub packets_dropped: u64,
    pub bytes_transferred: u64,
    /// Present when the high-throughput transport is attached
    pub ofdm: Option<OfdmStats>,
}
