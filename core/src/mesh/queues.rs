//! Packet queues: store-and-forward and bounded retries
//!
//! Both queues are hard-capacity-bounded and resolve overflow by dropping
//! the oldest entry. That bound is the engine's only defense against an
//! adversarial or pathological mesh, so it is enforced here rather than
//! trusted to callers.

use crate::address::MeshAddress;
use crate::message::MeshPacket;
use std::collections::{HashMap, VecDeque};

/// Packets held per destination before the oldest is dropped.
pub const STORE_QUEUE_CAPACITY: usize = 10;

/// Failed transmissions are retried this many times before counting as lost.
pub const MAX_RETRIES: u32 = 3;

/// Per-destination FIFO of packets waiting for a route to appear.
#[derive(Debug, Default)]
pub struct StoreQueue {
    queues: HashMap<MeshAddress, VecDeque<MeshPacket>>,
}

impl StoreQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet for later delivery. Returns the packet displaced by
    /// overflow, if the destination queue was full.
    pub fn enqueue(&mut self, packet: MeshPacket) -> Option<MeshPacket> {
        let queue = self.queues.entry(packet.destination).or_default();
        let displaced = if queue.len() >= STORE_QUEUE_CAPACITY {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(packet);
        displaced
    }

    /// Take the oldest stored packet for a destination.
    pub fn pop_front(&mut self, destination: &MeshAddress) -> Option<MeshPacket> {
        let queue = self.queues.get_mut(destination)?;
        let packet = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(destination);
        }
        packet
    }

    /// Destinations that currently have stored packets.
    pub fn destinations(&self) -> Vec<MeshAddress> {
        self.queues.keys().copied().collect()
    }

    pub fn len_for(&self, destination: &MeshAddress) -> usize {
        self.queues.get(destination).map_or(0, VecDeque::len)
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

/// A packet awaiting retransmission.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub packet: MeshPacket,
    pub retry_count: u32,
}

/// message id -> pending retry. An ACK or `MAX_RETRIES` failures removes
/// the entry.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: HashMap<String, RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a packet whose transmission just failed.
    pub fn insert(&mut self, packet: MeshPacket) {
        self.entries.insert(
            packet.message_id.clone(),
            RetryEntry {
                packet,
                retry_count: 0,
            },
        );
    }

    /// Snapshot of pending entries for a retry pass.
    pub fn pending(&self) -> Vec<RetryEntry> {
        self.entries.values().cloned().collect()
    }

    /// Record a failed attempt. Returns `true` when the entry has exhausted
    /// its retries and has been removed (count it as dropped).
    pub fn record_failure(&mut self, message_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(message_id) else {
            return false;
        };
        entry.retry_count += 1;
        if entry.retry_count >= MAX_RETRIES {
            self.entries.remove(message_id);
            true
        } else {
            false
        }
    }

    /// Drop an entry after successful delivery (or an ACK).
    pub fn remove(&mut self, message_id: &str) -> bool {
        self.entries.remove(message_id).is_some()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
