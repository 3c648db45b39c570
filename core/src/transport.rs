//! Transport boundary: the radio link as two trait seams
//!
//! The mesh engine never touches modulation internals. It sees two send
//! paths: a legacy request/response exchange for control traffic and
//! low-throughput data, and a high-throughput OFDM path selected by the
//! link-quality heuristics in the relay engine. Both are implemented
//! outside this crate (and by in-memory fakes in tests).

use crate::address::MeshAddress;
use crate::MeshError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Physical transmission mode for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionMode {
    /// High-throughput multi-carrier mode
    Ofdm,
    /// Legacy single-carrier mode
    Qpsk,
}

/// Outcome of a single high-throughput transmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmitReport {
    pub success: bool,
    /// Effective throughput achieved (bits per second)
    pub throughput_bps: f64,
    /// Average SNR measured across carriers (dB)
    pub average_snr_db: f64,
}

/// Static configuration of the high-throughput modem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfdmConfig {
    pub carrier_count: usize,
    pub bandwidth_hz: u32,
    pub cyclic_prefix_ratio: f64,
}

/// Cumulative counters reported by the high-throughput modem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OfdmStats {
    pub frames_sent: u64,
    pub frames_failed: u64,
    pub bytes_sent: u64,
    pub average_throughput_bps: f64,
    pub average_snr_db: f64,
}

/// Legacy transport: simple request/response exchange over the radio link.
///
/// Carries control messages and low-throughput data. `next_hop` may be
/// `MeshAddress::BROADCAST` for all-stations control traffic.
#[async_trait]
pub trait LegacyTransport: Send + Sync {
    async fn send(
        &self,
        next_hop: MeshAddress,
        headers: &HashMap<String, String>,
        payload: &[u8],
    ) -> Result<(), MeshError>;
}

/// High-throughput transport: the OFDM physical layer.
///
/// Treated purely as an alternate send path; the relay engine decides when
/// to use it and falls back to the legacy path on failure.
#[async_trait]
pub trait HighThroughputTransport: Send + Sync {
    async fn transmit(&self, payload: &[u8]) -> Result<TransmitReport, MeshError>;

    fn carrier_count(&self) -> usize;

    fn bandwidth_hz(&self) -> u32;

    fn configuration(&self) -> OfdmConfig;

    fn statistics(&self) -> OfdmStats;
}

/// Header key naming the envelope kind, for transports that surface
/// request metadata (the legacy path models an HTTP-style exchange).
pub const HEADER_MESSAGE_TYPE: &str = "x-mesh-type";

/// Build the standard header set for a wire envelope kind.
pub fn wire_headers(kind: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(HEADER_MESSAGE_TYPE.to_string(), kind.to_string());
    headers
}
