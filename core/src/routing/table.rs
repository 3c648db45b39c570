//! Routing table: destination-keyed routes with AODV freshness ordering
//!
//! The table is pure state: every operation takes the current time as a
//! parameter so maintenance can be driven by a scheduler and tested
//! deterministically. The single rule that keeps the mesh loop-free lives
//! here: a candidate route replaces the current one only when it is
//! strictly fresher (higher sequence number) or equally fresh and strictly
//! shorter.

use crate::address::MeshAddress;
use crate::transport::TransmissionMode;
use std::collections::HashMap;

/// Routes older than this are considered stale and ignored/evicted (seconds).
pub const ROUTE_STALE_SECS: u64 = 300;

/// Hard cap on table size; oldest entries are evicted first beyond it.
pub const MAX_ROUTING_TABLE_SIZE: usize = 100;

/// Cost multiplier per hop for learned (non-neighbor) routes.
pub const HOP_METRIC: u32 = 10;

/// Link quality score (0-100) from a received signal strength in dBm.
///
/// -90 dBm maps to 0, -30 dBm and above to 100.
pub fn link_quality_from_signal(signal_dbm: f64) -> u8 {
    let quality = ((signal_dbm + 90.0) / 60.0 * 100.0).round();
    quality.clamp(0.0, 100.0) as u8
}

/// A single routing-table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub destination: MeshAddress,
    pub next_hop: MeshAddress,
    /// Lower is better: hop-count cost for learned routes, |signal dBm|
    /// for direct neighbors
    pub metric: u32,
    pub sequence_number: u64,
    /// Unix seconds of the last install/refresh
    pub last_updated: u64,
    /// 0-100, from signal strength
    pub link_quality: u8,
    pub hop_count: u8,
    /// Preferred physical mode for this route
    pub mode_hint: TransmissionMode,
    pub ofdm_capable: bool,
}

impl RouteEntry {
    /// Age of this entry at `now`.
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_updated)
    }

    /// Whether this entry is still usable at `now`.
    pub fn is_fresh(&self, now: u64) -> bool {
        self.age_secs(now) < ROUTE_STALE_SECS
    }
}

/// A route learned from a control message, before the freshness check.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub next_hop: MeshAddress,
    pub hop_count: u8,
    pub sequence_number: u64,
}

/// Destination-keyed routing table with bounded size.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<MeshAddress, RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or refresh a direct (1-hop) neighbor route.
    ///
    /// Unconditionally overwrites any existing entry: a direct observation
    /// beats whatever we learned indirectly.
    pub fn upsert_neighbor(&mut self, address: MeshAddress, signal_dbm: f64, observed_at: u64) {
        let entry = RouteEntry {
            destination: address,
            next_hop: address,
            metric: signal_dbm.abs() as u32,
            sequence_number: 0,
            last_updated: observed_at,
            link_quality: link_quality_from_signal(signal_dbm),
            hop_count: 1,
            mode_hint: TransmissionMode::Qpsk,
            ofdm_capable: false,
        };
        self.entries.insert(address, entry);
    }

    /// Apply the AODV freshness rule to a learned route.
    ///
    /// The candidate replaces the current entry iff there is no current
    /// entry, its sequence number is strictly greater, or the sequence
    /// numbers are equal and its hop count is strictly lower. Returns
    /// whether the candidate was installed.
    pub fn consider(
        &mut self,
        destination: MeshAddress,
        candidate: RouteCandidate,
        now: u64,
    ) -> bool {
        let accept = match self.entries.get(&destination) {
            None => true,
            Some(current) => {
                candidate.sequence_number > current.sequence_number
                    || (candidate.sequence_number == current.sequence_number
                        && candidate.hop_count < current.hop_count)
            }
        };
        if !accept {
            return false;
        }

        // Carry capability knowledge forward when the next hop is unchanged.
        let (mode_hint, ofdm_capable, link_quality) = match self.entries.get(&destination) {
            Some(current) if current.next_hop == candidate.next_hop => {
                (current.mode_hint, current.ofdm_capable, current.link_quality)
            }
            _ => (TransmissionMode::Qpsk, false, 50),
        };

        let entry = RouteEntry {
            destination,
            next_hop: candidate.next_hop,
            metric: candidate.hop_count as u32 * HOP_METRIC,
            sequence_number: candidate.sequence_number,
            last_updated: now,
            link_quality,
            hop_count: candidate.hop_count,
            mode_hint,
            ofdm_capable,
        };
        self.entries.insert(destination, entry);
        true
    }

    /// Record what a beacon told us about a station's modem capabilities.
    pub fn note_ofdm_capability(&mut self, address: MeshAddress, capable: bool) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.ofdm_capable = capable;
            entry.mode_hint = if capable {
                TransmissionMode::Ofdm
            } else {
                TransmissionMode::Qpsk
            };
        }
    }

    /// Fresh entry for a destination, if any.
    pub fn lookup(&self, destination: &MeshAddress, now: u64) -> Option<&RouteEntry> {
        self.entries
            .get(destination)
            .filter(|entry| entry.is_fresh(now))
    }

    /// Entry regardless of freshness (maintenance/introspection only).
    pub fn get(&self, destination: &MeshAddress) -> Option<&RouteEntry> {
        self.entries.get(destination)
    }

    pub fn remove(&mut self, destination: &MeshAddress) -> Option<RouteEntry> {
        self.entries.remove(destination)
    }

    /// Drop the direct route to a neighbor and every route through it.
    ///
    /// Returns the destinations that became unreachable.
    pub fn remove_neighbor(&mut self, address: &MeshAddress) -> Vec<MeshAddress> {
        let mut lost = Vec::new();
        self.entries.retain(|destination, entry| {
            if destination == address || entry.next_hop == *address {
                lost.push(*destination);
                false
            } else {
                true
            }
        });
        lost
    }

    /// Drop every route whose next hop is one of the given addresses.
    pub fn remove_via(&mut self, next_hops: &[MeshAddress]) -> Vec<MeshAddress> {
        let mut lost = Vec::new();
        self.entries.retain(|destination, entry| {
            if next_hops.contains(&entry.next_hop) {
                lost.push(*destination);
                false
            } else {
                true
            }
        });
        lost
    }

    /// Evict entries unrefreshed for `ROUTE_STALE_SECS`.
    pub fn evict_stale(&mut self, now: u64) -> Vec<MeshAddress> {
        let mut evicted = Vec::new();
        self.entries.retain(|destination, entry| {
            if entry.is_fresh(now) {
                true
            } else {
                evicted.push(*destination);
                false
            }
        });
        evicted
    }

    /// Enforce `MAX_ROUTING_TABLE_SIZE`, evicting oldest-updated first.
    pub fn enforce_capacity(&mut self) -> Vec<MeshAddress> {
        let mut evicted = Vec::new();
        while self.entries.len() > MAX_ROUTING_TABLE_SIZE {
            let oldest = self
                .entries
                .values()
                .min_by_key(|entry| entry.last_updated)
                .map(|entry| entry.destination);
            match oldest {
                Some(destination) => {
                    self.entries.remove(&destination);
                    evicted.push(destination);
                }
                None => break,
            }
        }
        evicted
    }

    pub fn snapshot(&self) -> Vec<RouteEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
