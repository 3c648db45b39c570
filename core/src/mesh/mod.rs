//! Mesh network: the store-and-forward relay engine built on the router

pub mod network;
pub mod node;
pub mod queues;

pub use network::MeshNetwork;
pub use node::{MeshNode, NetworkStats, NodeCapabilities, NodeMetrics, NODE_TIMEOUT_SECS};
pub use queues::{RetryEntry, RetryQueue, StoreQueue, MAX_RETRIES, STORE_QUEUE_CAPACITY};
