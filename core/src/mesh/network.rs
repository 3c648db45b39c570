//! The relay/forwarding engine: application intent to radio transmissions
//!
//! `MeshNetwork` owns the node registry, the local station descriptor, and
//! the store/retry queues. It asks the router for routes, picks the
//! physical send path per link conditions, and feeds inbound traffic back
//! into the router or up to the application.
//!
//! All periodic work is an explicit `*_tick()` entry point; `start()` just
//! wires them to interval loops. Tests call the ticks directly.

use crate::address::MeshAddress;
use crate::mesh::node::{MeshNode, NetworkStats, NodeCapabilities};
use crate::mesh::queues::{RetryQueue, StoreQueue};
use crate::message::{Ack, Beacon, MeshPacket, WireMessage};
use crate::routing::router::Router;
use crate::routing::table::RouteEntry;
use crate::transport::{wire_headers, HighThroughputTransport, LegacyTransport, TransmissionMode};
use crate::{unix_now, MeshDelegate, MeshError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Router maintenance cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// Capability beacon cadence.
const BEACON_INTERVAL: Duration = Duration::from_secs(60);
/// Retry-queue drain cadence.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Node eviction / store-flush cadence.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum local SNR estimate to pick the OFDM path blind (dB).
const MIN_OFDM_SNR_DB: f64 = 15.0;
/// Minimum route link quality to pick the OFDM path (0-100).
const OFDM_LINK_QUALITY_FLOOR: u8 = 70;

/// The mesh relay engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MeshNetwork {
    my_node: Arc<RwLock<MeshNode>>,
    nodes: Arc<RwLock<std::collections::HashMap<MeshAddress, MeshNode>>>,
    router: Router,
    legacy: Arc<dyn LegacyTransport>,
    ofdm: Option<Arc<dyn HighThroughputTransport>>,
    store: Arc<Mutex<StoreQueue>>,
    retries: Arc<Mutex<RetryQueue>>,
    delegate: Arc<RwLock<Option<Arc<dyn MeshDelegate>>>>,
    relay_enabled: Arc<AtomicBool>,
    store_enabled: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MeshNetwork {
    pub fn new(
        callsign: &str,
        capabilities: NodeCapabilities,
        legacy: Arc<dyn LegacyTransport>,
        ofdm: Option<Arc<dyn HighThroughputTransport>>,
    ) -> Self {
        let now = unix_now();
        let my_node = MeshNode::local(callsign, capabilities.clone(), now);
        let router = Router::new(my_node.address, legacy.clone());
        info!(callsign = %my_node.callsign, address = %my_node.address, "mesh network created");
        Self {
            my_node: Arc::new(RwLock::new(my_node)),
            nodes: Arc::new(RwLock::new(std::collections::HashMap::new())),
            router,
            legacy,
            ofdm,
            store: Arc::new(Mutex::new(StoreQueue::new())),
            retries: Arc::new(Mutex::new(RetryQueue::new())),
            delegate: Arc::new(RwLock::new(None)),
            relay_enabled: Arc::new(AtomicBool::new(capabilities.relay)),
            store_enabled: Arc::new(AtomicBool::new(capabilities.store)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// This station's mesh address.
    pub fn address(&self) -> MeshAddress {
        self.my_node.read().address
    }

    /// The routing engine, for neighbor management and route introspection.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Subscribe the application to local-delivery events.
    pub fn set_delegate(&self, delegate: Arc<dyn MeshDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// Spawn the periodic timer loops. Idempotent only in the sense that
    /// calling it twice doubles the timers; call once.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        tasks.push(self.spawn_interval(MAINTENANCE_INTERVAL, |net| async move {
            net.router.maintain(unix_now()).await;
        }));
        tasks.push(self.spawn_interval(BEACON_INTERVAL, |net| async move {
            net.beacon_tick().await;
        }));
        tasks.push(self.spawn_interval(RETRY_INTERVAL, |net| async move {
            net.retry_tick().await;
        }));
        tasks.push(self.spawn_interval(HOUSEKEEPING_INTERVAL, |net| async move {
            net.housekeeping_tick().await;
        }));
        info!("mesh timers started");
    }

    /// Stop all timers and cancel every in-flight discovery wait.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.router.shutdown();
        info!("mesh network shut down");
    }

    fn spawn_interval<F, Fut>(&self, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(MeshNetwork) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let net = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick is not wanted
            loop {
                interval.tick().await;
                tick(net.clone()).await;
            }
        })
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Deliver an application payload to a destination station.
    ///
    /// Returns `false` when no route could be discovered. A transmission
    /// failure still returns `true`: the packet is queued for retry.
    pub async fn send_packet(&self, destination: MeshAddress, payload: Vec<u8>) -> bool {
        let Some(route) = self.router.discover_route(destination).await else {
            debug!(destination = %destination, "send failed: no route");
            return false;
        };

        let packet = MeshPacket::new(self.address(), destination, payload);
        match self.transmit_packet(&route, &packet).await {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, message_id = %packet.message_id, "transmit failed, queued for retry");
                self.retries.lock().insert(packet);
                true
            }
        }
    }

    /// Process a packet addressed into the mesh: deliver, forward, store,
    /// or drop per TTL/route/capability state.
    pub async fn relay_packet(&self, mut packet: MeshPacket) {
        if packet.ttl == 0 {
            debug!(message_id = %packet.message_id, "ttl expired, dropping");
            self.count_dropped();
            return;
        }
        packet.ttl -= 1;
        packet.hop_count += 1;

        if packet.destination == self.address() {
            self.deliver_local(packet).await;
            return;
        }

        if !self.relay_enabled.load(Ordering::Relaxed) {
            debug!(message_id = %packet.message_id, "relay disabled, dropping");
            self.count_dropped();
            return;
        }

        match self.router.discover_route(packet.destination).await {
            Some(route) => match self.transmit_packet(&route, &packet).await {
                Ok(()) => {
                    self.my_node.write().metrics.packets_relayed += 1;
                }
                Err(err) => {
                    debug!(%err, message_id = %packet.message_id, "relay transmit failed, queued");
                    self.retries.lock().insert(packet);
                }
            },
            None if self.store_enabled.load(Ordering::Relaxed) => {
                let displaced = self.store.lock().enqueue(packet);
                if let Some(displaced) = displaced {
                    debug!(message_id = %displaced.message_id, "store queue overflow");
                    self.count_dropped();
                }
            }
            None => {
                debug!(message_id = %packet.message_id, "no route and store disabled, dropping");
                self.count_dropped();
            }
        }
    }

    async fn deliver_local(&self, packet: MeshPacket) {
        debug!(message_id = %packet.message_id, source = %packet.source, "packet delivered locally");
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_packet_received(packet.clone());
        }

        if packet.ack_required {
            self.send_ack(&packet).await;
        }
    }

    /// Best-effort ACK back toward the packet source.
    async fn send_ack(&self, packet: &MeshPacket) {
        let Some(route) = self.router.discover_route(packet.source).await else {
            debug!(source = %packet.source, "no return route for ack");
            return;
        };
        let ack = WireMessage::Ack(Ack {
            message_id: packet.message_id.clone(),
            source: self.address(),
            destination: packet.source,
            timestamp: unix_now(),
        });
        if let Err(err) = self
            .legacy
            .send(route.next_hop, &wire_headers("ack"), &ack.to_bytes())
            .await
        {
            debug!(%err, "ack send failed");
        }
    }

    // ------------------------------------------------------------------
    // Transmission-mode selection
    // ------------------------------------------------------------------

    /// Whether the OFDM path should carry the next transmission.
    ///
    /// With route knowledge: the far end must be OFDM-capable, the link
    /// good (quality above the floor), and the route's mode hint must not
    /// demand legacy. Blind (no route info): fall back to the local SNR
    /// estimate.
    pub fn should_use_high_throughput_mode(&self, route: Option<&RouteEntry>) -> bool {
        if self.ofdm.is_none() {
            return false;
        }
        match route {
            Some(entry) => {
                entry.ofdm_capable
                    && entry.link_quality > OFDM_LINK_QUALITY_FLOOR
                    && entry.mode_hint != TransmissionMode::Qpsk
            }
            None => self.my_node.read().snr >= MIN_OFDM_SNR_DB,
        }
    }

    /// Send a data packet toward its next hop, OFDM-first when conditions
    /// allow, falling back to the legacy path for the same packet.
    async fn transmit_packet(
        &self,
        route: &RouteEntry,
        packet: &MeshPacket,
    ) -> Result<(), MeshError> {
        let bytes = WireMessage::Data(packet.clone()).to_bytes();

        if self.should_use_high_throughput_mode(Some(route)) {
            if let Some(ofdm) = &self.ofdm {
                match ofdm.transmit(&bytes).await {
                    Ok(report) if report.success => {
                        let mut node = self.my_node.write();
                        node.snr = report.average_snr_db;
                        node.metrics.ofdm_frames_sent += 1;
                        node.metrics.bytes_transferred += bytes.len() as u64;
                        return Ok(());
                    }
                    Ok(_) | Err(_) => {
                        debug!(next_hop = %route.next_hop, "ofdm transmit failed, falling back to legacy");
                        self.my_node.write().metrics.ofdm_frame_errors += 1;
                    }
                }
            }
        }

        self.legacy
            .send(route.next_hop, &wire_headers("data"), &bytes)
            .await?;
        self.my_node.write().metrics.bytes_transferred += bytes.len() as u64;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Feed a frame heard on the radio into the engine.
    ///
    /// `sender` is the station the frame was heard from (not necessarily
    /// the packet's origin) and `signal_dbm` is the receiver-measured RSSI.
    pub async fn handle_inbound(&self, sender: MeshAddress, signal_dbm: f64, bytes: &[u8]) {
        let Some(message) = WireMessage::from_bytes(bytes) else {
            debug!(sender = %sender, "malformed frame, dropping");
            return;
        };

        match message {
            WireMessage::RouteRequest(rreq) => self.router.handle_route_request(rreq, sender).await,
            WireMessage::RouteReply(rrep) => self.router.handle_route_reply(rrep, sender).await,
            WireMessage::RouteError(rerr) => self.router.handle_route_error(rerr).await,
            WireMessage::Data(packet) => self.relay_packet(packet).await,
            WireMessage::Beacon(beacon) => self.handle_beacon(beacon, signal_dbm),
            WireMessage::Ack(ack) => self.handle_ack(ack).await,
        }
    }

    fn handle_beacon(&self, beacon: Beacon, signal_dbm: f64) {
        if beacon.address == self.address() {
            return; // our own beacon echoed back
        }
        let now = unix_now();
        debug!(callsign = %beacon.callsign, address = %beacon.address, "beacon heard");

        {
            let mut nodes = self.nodes.write();
            let node = nodes.entry(beacon.address).or_insert_with(|| MeshNode {
                callsign: beacon.callsign.clone(),
                address: beacon.address,
                last_seen: now,
                signal_strength: signal_dbm,
                snr: 0.0,
                hop_distance: 1,
                capabilities: beacon.capabilities.clone(),
                metrics: Default::default(),
            });
            node.last_seen = now;
            node.signal_strength = signal_dbm;
            node.capabilities = beacon.capabilities.clone();
        }

        // A beacon is a direct observation: install the 1-hop route.
        self.router.add_neighbor(beacon.address, signal_dbm, now);
        self.router
            .note_ofdm_capability(beacon.address, beacon.capabilities.ofdm_capable());
    }

    async fn handle_ack(&self, ack: Ack) {
        if ack.destination == self.address() {
            if self.retries.lock().remove(&ack.message_id) {
                debug!(message_id = %ack.message_id, "delivery confirmed by ack");
            }
            return;
        }

        // In transit: pass it along toward the originator, best-effort.
        let Some(route) = self.router.lookup_route(&ack.destination) else {
            debug!(destination = %ack.destination, "no route to forward ack");
            return;
        };
        if let Err(err) = self
            .legacy
            .send(route.next_hop, &wire_headers("ack"), &WireMessage::Ack(ack).to_bytes())
            .await
        {
            debug!(%err, "ack forward failed");
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Broadcast the local capability descriptor. Best-effort.
    pub async fn beacon_tick(&self) {
        let beacon = {
            let node = self.my_node.read();
            Beacon {
                callsign: node.callsign.clone(),
                address: node.address,
                capabilities: node.capabilities.clone(),
                timestamp: unix_now(),
            }
        };
        let bytes = WireMessage::Beacon(beacon).to_bytes();

        if let Some(ofdm) = &self.ofdm {
            if let Err(err) = ofdm.transmit(&bytes).await {
                debug!(%err, "beacon transmit failed");
            }
        } else if let Err(err) = self
            .legacy
            .send(MeshAddress::BROADCAST, &wire_headers("beacon"), &bytes)
            .await
        {
            debug!(%err, "beacon send failed");
        }
    }

    /// Re-attempt every queued transmission; drop entries that have
    /// exhausted their retries.
    pub async fn retry_tick(&self) {
        let pending = self.retries.lock().pending();
        for entry in pending {
            let message_id = entry.packet.message_id.clone();
            let outcome = match self.router.discover_route(entry.packet.destination).await {
                Some(route) => self.transmit_packet(&route, &entry.packet).await,
                None => Err(MeshError::Transport("no route".into())),
            };

            match outcome {
                Ok(()) => {
                    self.retries.lock().remove(&message_id);
                }
                Err(_) => {
                    let exhausted = self.retries.lock().record_failure(&message_id);
                    if exhausted {
                        warn!(message_id = %message_id, "retries exhausted, dropping");
                        self.count_dropped();
                    }
                }
            }
        }
    }

    /// Evict silent nodes and opportunistically flush stored packets for
    /// destinations whose routes have appeared (at most one per
    /// destination per tick).
    pub async fn housekeeping_tick(&self) {
        let now = unix_now();

        let evicted: Vec<MeshAddress> = {
            let mut nodes = self.nodes.write();
            let expired: Vec<MeshAddress> = nodes
                .values()
                .filter(|node| node.is_expired(now))
                .map(|node| node.address)
                .collect();
            for address in &expired {
                nodes.remove(address);
            }
            expired
        };
        for address in evicted {
            debug!(address = %address, "node expired");
            self.router.remove_neighbor(&address);
        }

        let destinations = self.store.lock().destinations();
        for destination in destinations {
            let Some(route) = self.router.lookup_route(&destination) else {
                continue;
            };
            let Some(packet) = self.store.lock().pop_front(&destination) else {
                continue;
            };
            match self.transmit_packet(&route, &packet).await {
                Ok(()) => {
                    debug!(destination = %destination, "flushed stored packet");
                    self.my_node.write().metrics.packets_relayed += 1;
                }
                Err(_) => self.retries.lock().insert(packet),
            }
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn get_nodes(&self) -> Vec<MeshNode> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn get_my_node(&self) -> MeshNode {
        self.my_node.read().clone()
    }

    pub fn get_routing_table(&self) -> Vec<RouteEntry> {
        self.router.get_routing_table()
    }

    pub fn get_network_stats(&self) -> NetworkStats {
        let node = self.my_node.read();
        NetworkStats {
            node_count: self.nodes.read().len(),
            route_count: self.router.get_routing_table().len(),
            stored_packets: self.store.lock().total(),
            retry_pending: self.retries.lock().len(),
            packets_relayed: node.metrics.packets_relayed,
            packets_dropped: node.metrics.packets_dropped,
            bytes_transferred: node.metrics.bytes_transferred,
            ofdm: self.ofdm.as_ref().map(|transport| transport.statistics()),
        }
    }

    pub fn set_relay_enabled(&self, enabled: bool) {
        self.relay_enabled.store(enabled, Ordering::Relaxed);
        self.my_node.write().capabilities.relay = enabled;
    }

    pub fn set_store_enabled(&self, enabled: bool) {
        self.store_enabled.store(enabled, Ordering::Relaxed);
        self.my_node.write().capabilities.store = enabled;
    }

    fn count_dropped(&self) {
        self.my_node.write().metrics.packets_dropped += 1;
    }
}
