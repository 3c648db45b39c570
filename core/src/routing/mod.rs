//! AODV mesh routing: reactive route discovery over the radio link
//!
//! Three pieces:
//! - `table`: the destination-keyed routing table and the freshness rule
//!   that keeps the mesh loop-free
//! - `dedup`: the bounded first-seen cache that stops broadcast storms
//! - `router`: the engine tying them together: discovery, RREQ/RREP/RERR
//!   handling, and periodic maintenance

pub mod dedup;
pub mod router;
pub mod table;

pub use dedup::{DedupCache, CACHE_TTL_SECS, MAX_CACHE_SIZE};
pub use router::{RouteMetrics, Router, DISCOVERY_TIMEOUT, MAX_ROUTE_REQUEST_HOPS};
pub use table::{
    link_quality_from_signal, RouteCandidate, RouteEntry, RoutingTable, MAX_ROUTING_TABLE_SIZE,
    ROUTE_STALE_SECS,
};
