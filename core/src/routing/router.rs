//! AODV engine: on-demand route discovery over a broadcast medium
//!
//! The router owns the routing table and the dedup cache. Routes are
//! discovered only when asked for: `discover_route` broadcasts a route
//! request and suspends until a matching table entry appears or the
//! deadline passes. Inbound RREQ/RREP/RERR traffic mutates the table under
//! the freshness rule and wakes any discovery waiting on the destination.
//!
//! Every suspended wait is cancelable: shutdown flips a watch channel that
//! all in-flight discoveries select on, and the jittered rebroadcast tasks
//! are tracked so they can be aborted rather than left running.

use crate::address::MeshAddress;
use crate::message::{RouteError, RouteReply, RouteRequest, WireMessage};
use crate::routing::dedup::DedupCache;
use crate::routing::table::{RouteCandidate, RouteEntry, RoutingTable};
use crate::transport::{wire_headers, LegacyTransport};
use crate::unix_now;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long `discover_route` waits for a reply before giving up.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// A route request is not forwarded once it would reach this many hops.
pub const MAX_ROUTE_REQUEST_HOPS: u8 = 7;

/// Route validity advertised in replies (seconds).
pub const ROUTE_LIFETIME_SECS: u64 = 300;

/// Control-broadcast budget per one-second window.
pub const MAX_BROADCASTS_PER_SEC: usize = 5;

/// Jitter applied before rebroadcasting a route request, to desynchronize
/// concurrent relays (milliseconds).
const REBROADCAST_JITTER_MS: std::ops::RangeInclusive<u64> = 50..=150;

/// Read-only snapshot of route health for one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMetrics {
    pub hop_count: u8,
    pub link_quality: u8,
    pub age_secs: u64,
    pub metric: u32,
}

struct RouterState {
    table: RoutingTable,
    dedup: DedupCache,
    /// Local AODV sequence counter, bumped per originated RREQ/RREP
    sequence: u64,
    /// Sliding one-second window of recent control broadcasts
    broadcast_window: VecDeque<Instant>,
}

/// Shared wakeup for all discoveries of one destination. Reference-counted
/// so the entry survives until the last caller leaves, whichever order
/// their deadlines fire in.
struct Waiter {
    notify: Arc<Notify>,
    count: usize,
}

/// The AODV routing engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Router {
    address: MeshAddress,
    state: Arc<Mutex<RouterState>>,
    /// One waiter per destination with a discovery in flight
    waiters: Arc<Mutex<HashMap<MeshAddress, Waiter>>>,
    /// Jittered rebroadcast tasks, aborted on shutdown
    pending_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    transport: Arc<dyn LegacyTransport>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

enum RreqAction {
    Reply(RouteReply),
    Rebroadcast(RouteRequest),
    Drop,
}

impl Router {
    pub fn new(address: MeshAddress, transport: Arc<dyn LegacyTransport>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            address,
            state: Arc::new(Mutex::new(RouterState {
                table: RoutingTable::new(),
                dedup: DedupCache::new(),
                sequence: 0,
                broadcast_window: VecDeque::new(),
            })),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            pending_tasks: Arc::new(Mutex::new(Vec::new())),
            transport,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// This station's derived address.
    pub fn address(&self) -> MeshAddress {
        self.address
    }

    /// Install or refresh a 1-hop route to a directly heard station.
    pub fn add_neighbor(&self, address: MeshAddress, signal_dbm: f64, observed_at: u64) {
        self.state
            .lock()
            .table
            .upsert_neighbor(address, signal_dbm, observed_at);
        self.notify_route(address);
    }

    /// Drop the direct route and everything routed through the neighbor.
    ///
    /// Emits no RERR itself; the caller decides whether the loss is worth
    /// announcing.
    pub fn remove_neighbor(&self, address: &MeshAddress) -> Vec<MeshAddress> {
        let lost = self.state.lock().table.remove_neighbor(address);
        if !lost.is_empty() {
            debug!(neighbor = %address, lost = lost.len(), "neighbor removed");
        }
        lost
    }

    /// Record modem capability learned from a beacon.
    pub fn note_ofdm_capability(&self, address: MeshAddress, capable: bool) {
        self.state.lock().table.note_ofdm_capability(address, capable);
    }

    /// Fresh route for a destination without triggering discovery.
    pub fn lookup_route(&self, destination: &MeshAddress) -> Option<RouteEntry> {
        self.state
            .lock()
            .table
            .lookup(destination, unix_now())
            .cloned()
    }

    /// Find a route, discovering on demand.
    ///
    /// Returns immediately when a fresh entry exists. Otherwise originates
    /// exactly one RREQ and waits up to `DISCOVERY_TIMEOUT` for the table
    /// to learn the route. Concurrent calls for the same destination share
    /// the in-flight discovery and do not broadcast again. `None` means
    /// "no route", not an error; callers wanting resilience re-invoke.
    pub async fn discover_route(&self, destination: MeshAddress) -> Option<RouteEntry> {
        let now = unix_now();
        if let Some(entry) = self.state.lock().table.lookup(&destination, now).cloned() {
            return Some(entry);
        }

        let (notify, originator) = {
            let mut waiters = self.waiters.lock();
            match waiters.get_mut(&destination) {
                Some(waiter) => {
                    waiter.count += 1;
                    (waiter.notify.clone(), false)
                }
                None => {
                    let notify = Arc::new(Notify::new());
                    waiters.insert(
                        destination,
                        Waiter {
                            notify: notify.clone(),
                            count: 1,
                        },
                    );
                    (notify, true)
                }
            }
        };

        if originator {
            let rreq = {
                let mut state = self.state.lock();
                state.sequence += 1;
                let rreq = RouteRequest {
                    source: self.address,
                    destination,
                    sequence_number: state.sequence,
                    hop_count: 0,
                    message_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: now,
                };
                state.dedup.insert(&rreq.message_id, now);
                rreq
            };
            debug!(destination = %destination, "originating route request");
            self.broadcast(WireMessage::RouteRequest(rreq), "route_request")
                .await;
        }

        let deadline = Instant::now() + DISCOVERY_TIMEOUT;
        let mut shutdown = self.shutdown_rx.clone();
        let found = loop {
            // Arm the waiter before checking the table so an insert between
            // the check and the select cannot be missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self
                .state
                .lock()
                .table
                .lookup(&destination, unix_now())
                .cloned()
            {
                break Some(entry);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => break None,
                _ = shutdown.changed() => break None,
            }
        };

        {
            let mut waiters = self.waiters.lock();
            if let Some(waiter) = waiters.get_mut(&destination) {
                waiter.count -= 1;
                if waiter.count == 0 {
                    waiters.remove(&destination);
                }
            }
        }
        found
    }

    /// Process an inbound route request heard from `sender`.
    ///
    /// Idempotent on message id. Installs the reverse route, then either
    /// answers (as the destination or on its behalf) or rebroadcasts with
    /// jitter while the hop budget lasts.
    pub async fn handle_route_request(&self, rreq: RouteRequest, sender: MeshAddress) {
        let now = unix_now();
        let (reverse_installed, action) = {
            let mut state = self.state.lock();
            if !state.dedup.insert(&rreq.message_id, now) {
                return;
            }

            let reverse_installed = state.table.consider(
                rreq.source,
                RouteCandidate {
                    next_hop: sender,
                    hop_count: rreq.hop_count + 1,
                    sequence_number: rreq.sequence_number,
                },
                now,
            );

            let action = if rreq.destination == self.address {
                state.sequence += 1;
                RreqAction::Reply(RouteReply {
                    source: self.address,
                    destination: rreq.source,
                    sequence_number: state.sequence,
                    hop_count: 0,
                    lifetime: ROUTE_LIFETIME_SECS,
                    message_id: uuid::Uuid::new_v4().to_string(),
                })
            } else if let Some(route) = state.table.lookup(&rreq.destination, now) {
                // Intermediate reply on behalf of the destination.
                RreqAction::Reply(RouteReply {
                    source: rreq.destination,
                    destination: rreq.source,
                    sequence_number: route.sequence_number,
                    hop_count: route.hop_count,
                    lifetime: ROUTE_LIFETIME_SECS,
                    message_id: uuid::Uuid::new_v4().to_string(),
                })
            } else if rreq.hop_count + 1 < MAX_ROUTE_REQUEST_HOPS {
                let mut forwarded = rreq.clone();
                forwarded.hop_count += 1;
                RreqAction::Rebroadcast(forwarded)
            } else {
                RreqAction::Drop
            };

            (reverse_installed, action)
        };

        if reverse_installed {
            self.notify_route(rreq.source);
        }

        match action {
            RreqAction::Reply(rrep) => {
                self.send_control(sender, WireMessage::RouteReply(rrep), "route_reply")
                    .await;
            }
            RreqAction::Rebroadcast(forwarded) => self.spawn_jittered_rebroadcast(forwarded),
            RreqAction::Drop => {}
        }
    }

    /// Process an inbound route reply heard from `sender`.
    ///
    /// Installs the forward route to `rrep.source`, then forwards the reply
    /// toward the original requester when we are not it. A missing reverse
    /// route means the reply is dropped silently.
    pub async fn handle_route_reply(&self, rrep: RouteReply, sender: MeshAddress) {
        let now = unix_now();
        let (forward_installed, forward) = {
            let mut state = self.state.lock();
            let forward_installed = state.table.consider(
                rrep.source,
                RouteCandidate {
                    next_hop: sender,
                    hop_count: rrep.hop_count + 1,
                    sequence_number: rrep.sequence_number,
                },
                now,
            );

            let forward = if rrep.destination != self.address {
                state
                    .table
                    .lookup(&rrep.destination, now)
                    .map(|route| route.next_hop)
                    .map(|next_hop| {
                        let mut forwarded = rrep.clone();
                        forwarded.hop_count += 1;
                        (next_hop, forwarded)
                    })
            } else {
                None
            };

            (forward_installed, forward)
        };

        if forward_installed {
            self.notify_route(rrep.source);
        }

        if let Some((next_hop, forwarded)) = forward {
            self.send_control(next_hop, WireMessage::RouteReply(forwarded), "route_reply")
                .await;
        }
    }

    /// Process an inbound route error.
    ///
    /// Removes the listed destinations, then cascades: routes whose next
    /// hop just became unreachable are removed too, and one RERR naming
    /// the newly affected destinations is broadcast when any exist.
    pub async fn handle_route_error(&self, rerr: RouteError) {
        let cascade = {
            let mut state = self.state.lock();
            for destination in &rerr.unreachable_destinations {
                state.table.remove(destination);
            }
            state.table.remove_via(&rerr.unreachable_destinations)
        };

        if !cascade.is_empty() {
            warn!(affected = cascade.len(), "route error cascade");
            self.broadcast(
                WireMessage::RouteError(RouteError {
                    unreachable_destinations: cascade,
                    source: self.address,
                }),
                "route_error",
            )
            .await;
        }
    }

    /// Periodic maintenance (~30 s): stale-route eviction, dedup pruning,
    /// capacity enforcement. Evicting any routes broadcasts one RERR
    /// naming them; capacity evictions are silent.
    pub async fn maintain(&self, now: u64) {
        let evicted = {
            let mut state = self.state.lock();
            let evicted = state.table.evict_stale(now);
            state.dedup.prune(now);
            state.table.enforce_capacity();
            evicted
        };

        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "evicted stale routes");
            self.broadcast(
                WireMessage::RouteError(RouteError {
                    unreachable_destinations: evicted,
                    source: self.address,
                }),
                "route_error",
            )
            .await;
        }
    }

    /// Snapshot of the routing table.
    pub fn get_routing_table(&self) -> Vec<RouteEntry> {
        self.state.lock().table.snapshot()
    }

    /// Route health for one destination, if known.
    pub fn get_route_metrics(&self, destination: &MeshAddress) -> Option<RouteMetrics> {
        let state = self.state.lock();
        state.table.get(destination).map(|entry| RouteMetrics {
            hop_count: entry.hop_count,
            link_quality: entry.link_quality,
            age_secs: entry.age_secs(unix_now()),
            metric: entry.metric,
        })
    }

    /// Cancel all in-flight discovery waits and pending rebroadcasts.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.pending_tasks.lock().drain(..) {
            task.abort();
        }
        self.waiters.lock().clear();
    }

    fn notify_route(&self, destination: MeshAddress) {
        if let Some(waiter) = self.waiters.lock().get(&destination) {
            waiter.notify.notify_waiters();
        }
    }

    fn spawn_jittered_rebroadcast(&self, rreq: RouteRequest) {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(REBROADCAST_JITTER_MS));
        let router = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    router
                        .broadcast(WireMessage::RouteRequest(rreq), "route_request")
                        .await;
                }
                _ = shutdown.changed() => {}
            }
        });

        let mut tasks = self.pending_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Rate-limited control broadcast. Dropping on limit is deliberate:
    /// control traffic is best-effort and the window bounds storm amplitude.
    async fn broadcast(&self, message: WireMessage, kind: &str) {
        if !self.allow_broadcast() {
            debug!(kind, "broadcast window exhausted, dropping");
            return;
        }
        let headers = wire_headers(kind);
        if let Err(err) = self
            .transport
            .send(MeshAddress::BROADCAST, &headers, &message.to_bytes())
            .await
        {
            debug!(%err, kind, "broadcast failed");
        }
    }

    async fn send_control(&self, next_hop: MeshAddress, message: WireMessage, kind: &str) {
        let headers = wire_headers(kind);
        if let Err(err) = self
            .transport
            .send(next_hop, &headers, &message.to_bytes())
            .await
        {
            debug!(%err, kind, next_hop = %next_hop, "control send failed");
        }
    }

    /// Sliding-window broadcast budget, tracked on its own counter rather
    /// than piggybacked on the dedup cache.
    fn allow_broadcast(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        while state
            .broadcast_window
            .front()
            .is_some_and(|sent| now.duration_since(*sent) >= Duration::from_secs(1))
        {
            state.broadcast_window.pop_front();
        }
        if state.broadcast_window.len() < MAX_BROADCASTS_PER_SEC {
            state.broadcast_window.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MeshError;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    fn addr(callsign: &str) -> MeshAddress {
        MeshAddress::from_callsign(callsign)
    }

    /// Records every send; optionally fails all of them.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(MeshAddress, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn sent_to(&self, target: MeshAddress) -> Vec<WireMessage> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, _)| *to == target)
                .filter_map(|(_, bytes)| WireMessage::from_bytes(bytes))
                .collect()
        }

        fn broadcasts(&self) -> Vec<WireMessage> {
            self.sent_to(MeshAddress::BROADCAST)
        }
    }

    #[async_trait]
    impl LegacyTransport for RecordingTransport {
        async fn send(
            &self,
            next_hop: MeshAddress,
            _headers: &StdHashMap<String, String>,
            payload: &[u8],
        ) -> Result<(), MeshError> {
            self.sent.lock().push((next_hop, payload.to_vec()));
            Ok(())
        }
    }

    fn make_router(callsign: &str) -> (Router, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let router = Router::new(MeshAddress::from_callsign(callsign), transport.clone());
        (router, transport)
    }

    fn make_rreq(source: MeshAddress, destination: MeshAddress, hops: u8, id: &str) -> RouteRequest {
        RouteRequest {
            source,
            destination,
            sequence_number: 1,
            hop_count: hops,
            message_id: id.to_string(),
            timestamp: unix_now(),
        }
    }

    #[tokio::test]
    async fn test_discover_returns_known_route_without_traffic() {
        let (router, transport) = make_router("ME");
        let n1 = addr("N1");
        router.add_neighbor(n1, -50.0, unix_now());

        let route = router.discover_route(n1).await.unwrap();
        assert_eq!(route.next_hop, n1);
        assert_eq!(route.hop_count, 1);
        assert_eq!(route.link_quality, 67);
        assert!(transport.broadcasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_broadcasts_exactly_one_rreq() {
        let (router, transport) = make_router("ME");

        let result = router.discover_route(addr("NOWHERE")).await;
        assert!(result.is_none());

        let rreqs: Vec<_> = transport
            .broadcasts()
            .into_iter()
            .filter(|m| matches!(m, WireMessage::RouteRequest(_)))
            .collect();
        assert_eq!(rreqs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_resolves_on_route_reply() {
        let (router, _transport) = make_router("ME");
        let dest = addr("DEST");
        let relay = addr("RELAY");

        let discovering = {
            let router = router.clone();
            tokio::spawn(async move { router.discover_route(dest).await })
        };
        tokio::task::yield_now().await;

        router
            .handle_route_reply(
                RouteReply {
                    source: dest,
                    destination: router.address(),
                    sequence_number: 3,
                    hop_count: 1,
                    lifetime: ROUTE_LIFETIME_SECS,
                    message_id: "rrep-1".into(),
                },
                relay,
            )
            .await;

        let route = discovering.await.unwrap().expect("route should resolve");
        assert_eq!(route.next_hop, relay);
        assert_eq!(route.hop_count, 2);
        assert_eq!(route.sequence_number, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_discovery_shares_one_rreq() {
        let (router, transport) = make_router("ME");
        let dest = addr("DEST");

        let first = {
            let router = router.clone();
            tokio::spawn(async move { router.discover_route(dest).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let router = router.clone();
            tokio::spawn(async move { router.discover_route(dest).await })
        };

        assert!(first.await.unwrap().is_none());
        assert!(second.await.unwrap().is_none());

        let rreqs: Vec<_> = transport
            .broadcasts()
            .into_iter()
            .filter(|m| matches!(m, WireMessage::RouteRequest(_)))
            .collect();
        assert_eq!(rreqs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_still_notified_after_originator_times_out() {
        let (router, _transport) = make_router("ME");
        let dest = addr("DEST");
        let relay = addr("RELAY");

        // First caller originates at t=0, deadline t=10
        let first = {
            let router = router.clone();
            tokio::spawn(async move { router.discover_route(dest).await })
        };
        tokio::task::yield_now().await;

        // Second caller joins at t=5, deadline t=15
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = {
            let router = router.clone();
            tokio::spawn(async move { router.discover_route(dest).await })
        };
        tokio::task::yield_now().await;

        // Let the first caller's deadline pass, then install the route at
        // t=11, still inside the second caller's window
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(first.await.unwrap().is_none());

        router
            .handle_route_reply(
                RouteReply {
                    source: dest,
                    destination: router.address(),
                    sequence_number: 1,
                    hop_count: 0,
                    lifetime: ROUTE_LIFETIME_SECS,
                    message_id: "rrep-late".into(),
                },
                relay,
            )
            .await;

        let route = second
            .await
            .unwrap()
            .expect("route arrived within the second caller's deadline");
        assert_eq!(route.next_hop, relay);
    }

    #[tokio::test]
    async fn test_rreq_for_us_replies_to_sender() {
        let (router, transport) = make_router("ME");
        let requester = addr("REQ");
        let sender = addr("PREV");

        router
            .handle_route_request(make_rreq(requester, router.address(), 2, "rreq-1"), sender)
            .await;

        // Reverse route installed via the sender
        let reverse = router.lookup_route(&requester).unwrap();
        assert_eq!(reverse.next_hop, sender);
        assert_eq!(reverse.hop_count, 3);

        let replies = transport.sent_to(sender);
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            WireMessage::RouteReply(rrep) => {
                assert_eq!(rrep.source, router.address());
                assert_eq!(rrep.destination, requester);
                assert_eq!(rrep.hop_count, 0);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_rreq_is_ignored() {
        let (router, transport) = make_router("ME");
        let sender = addr("PREV");
        let rreq = make_rreq(addr("REQ"), router.address(), 1, "dup-1");

        router.handle_route_request(rreq.clone(), sender).await;
        let sends_after_first = transport.sent.lock().len();

        router.handle_route_request(rreq, sender).await;
        assert_eq!(transport.sent.lock().len(), sends_after_first);
    }

    #[tokio::test]
    async fn test_intermediate_rrep_on_behalf_of_destination() {
        let (router, transport) = make_router("ME");
        let dest = addr("DEST");
        let via = addr("VIA");
        let sender = addr("PREV");

        // We already know a route to the destination
        let now = unix_now();
        router.state.lock().table.consider(
            dest,
            RouteCandidate {
                next_hop: via,
                hop_count: 2,
                sequence_number: 9,
            },
            now,
        );

        router
            .handle_route_request(make_rreq(addr("REQ"), dest, 0, "rreq-2"), sender)
            .await;

        let replies = transport.sent_to(sender);
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            WireMessage::RouteReply(rrep) => {
                assert_eq!(rrep.source, dest);
                assert_eq!(rrep.sequence_number, 9);
                assert_eq!(rrep.hop_count, 2);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rreq_rebroadcast_with_jitter_and_hop_increment() {
        let (router, transport) = make_router("ME");

        router
            .handle_route_request(make_rreq(addr("REQ"), addr("FAR"), 2, "rreq-3"), addr("PREV"))
            .await;
        assert!(transport.broadcasts().is_empty(), "must wait out the jitter");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let rebroadcasts = transport.broadcasts();
        assert_eq!(rebroadcasts.len(), 1);
        match &rebroadcasts[0] {
            WireMessage::RouteRequest(fwd) => assert_eq!(fwd.hop_count, 3),
            other => panic!("expected rebroadcast, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rreq_not_forwarded_at_hop_limit() {
        let (router, transport) = make_router("ME");

        router
            .handle_route_request(
                make_rreq(addr("REQ"), addr("FAR"), MAX_ROUTE_REQUEST_HOPS - 1, "rreq-4"),
                addr("PREV"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(transport.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_rrep_forwarded_toward_requester() {
        let (router, transport) = make_router("ME");
        let requester = addr("REQ");
        let back_hop = addr("BACK");
        let dest = addr("DEST");
        let from = addr("FROM");

        // Reverse route toward the requester exists (installed by the RREQ leg)
        let now = unix_now();
        router.state.lock().table.consider(
            requester,
            RouteCandidate {
                next_hop: back_hop,
                hop_count: 1,
                sequence_number: 1,
            },
            now,
        );

        router
            .handle_route_reply(
                RouteReply {
                    source: dest,
                    destination: requester,
                    sequence_number: 5,
                    hop_count: 1,
                    lifetime: ROUTE_LIFETIME_SECS,
                    message_id: "rrep-2".into(),
                },
                from,
            )
            .await;

        // Forward route installed
        let forward = router.lookup_route(&dest).unwrap();
        assert_eq!(forward.next_hop, from);
        assert_eq!(forward.hop_count, 2);

        // Reply relayed one hop back with incremented count
        let forwarded = transport.sent_to(back_hop);
        assert_eq!(forwarded.len(), 1);
        match &forwarded[0] {
            WireMessage::RouteReply(rrep) => assert_eq!(rrep.hop_count, 2),
            other => panic!("expected forwarded reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rrep_without_reverse_route_is_dropped() {
        let (router, transport) = make_router("ME");

        router
            .handle_route_reply(
                RouteReply {
                    source: addr("DEST"),
                    destination: addr("ELSEWHERE"),
                    sequence_number: 1,
                    hop_count: 0,
                    lifetime: ROUTE_LIFETIME_SECS,
                    message_id: "rrep-3".into(),
                },
                addr("FROM"),
            )
            .await;

        // Forward route still learned, but nothing forwarded
        assert!(router.lookup_route(&addr("DEST")).is_some());
        assert!(transport.sent_to(addr("ELSEWHERE")).is_empty());
    }

    #[tokio::test]
    async fn test_route_error_cascade() {
        let (router, transport) = make_router("ME");
        let x = addr("X");
        let y = addr("Y");
        let now = unix_now();
        {
            let mut state = router.state.lock();
            // Route to X direct, route to Y via X
            state.table.upsert_neighbor(x, -60.0, now);
            state.table.consider(
                y,
                RouteCandidate {
                    next_hop: x,
                    hop_count: 2,
                    sequence_number: 1,
                },
                now,
            );
        }

        router
            .handle_route_error(RouteError {
                unreachable_destinations: vec![x],
                source: addr("OTHER"),
            })
            .await;

        assert!(router.lookup_route(&x).is_none());
        assert!(router.lookup_route(&y).is_none());

        // Cascade announced: Y newly unreachable
        let rerrs: Vec<_> = transport
            .broadcasts()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::RouteError(rerr) => Some(rerr),
                _ => None,
            })
            .collect();
        assert_eq!(rerrs.len(), 1);
        assert_eq!(rerrs[0].unreachable_destinations, vec![y]);
    }

    #[tokio::test]
    async fn test_maintain_broadcasts_rerr_for_evicted() {
        let (router, transport) = make_router("ME");
        let stale_dest = addr("STALE");
        let now = unix_now();
        router.state.lock().table.consider(
            stale_dest,
            RouteCandidate {
                next_hop: addr("VIA"),
                hop_count: 1,
                sequence_number: 1,
            },
            now,
        );

        router.maintain(now + crate::routing::table::ROUTE_STALE_SECS).await;

        assert!(router.get_routing_table().is_empty());
        let rerrs: Vec<_> = transport
            .broadcasts()
            .into_iter()
            .filter(|m| matches!(m, WireMessage::RouteError(_)))
            .collect();
        assert_eq!(rerrs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_rate_limit() {
        let (router, transport) = make_router("ME");

        // Seven distinct RERR broadcasts in the same instant; window caps at 5
        for i in 0..7 {
            router
                .broadcast(
                    WireMessage::RouteError(RouteError {
                        unreachable_destinations: vec![addr(&format!("D{i}"))],
                        source: router.address(),
                    }),
                    "route_error",
                )
                .await;
        }
        assert_eq!(transport.broadcasts().len(), MAX_BROADCASTS_PER_SEC);

        // Window clears after a second
        tokio::time::advance(Duration::from_secs(1)).await;
        router
            .broadcast(
                WireMessage::RouteError(RouteError {
                    unreachable_destinations: vec![addr("LATE")],
                    source: router.address(),
                }),
                "route_error",
            )
            .await;
        assert_eq!(transport.broadcasts().len(), MAX_BROADCASTS_PER_SEC + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_inflight_discovery() {
        let (router, _transport) = make_router("ME");
        let dest = addr("DEST");

        let discovering = {
            let router = router.clone();
            tokio::spawn(async move { router.discover_route(dest).await })
        };
        tokio::task::yield_now().await;

        router.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), discovering)
            .await
            .expect("shutdown must resolve the wait, not the 10s deadline")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_remove_neighbor_drops_routes_through_it() {
        let (router, _transport) = make_router("ME");
        let n1 = addr("N1");
        let far = addr("FAR");
        let now = unix_now();
        router.add_neighbor(n1, -55.0, now);
        router.state.lock().table.consider(
            far,
            RouteCandidate {
                next_hop: n1,
                hop_count: 3,
                sequence_number: 2,
            },
            now,
        );

        let mut lost = router.remove_neighbor(&n1);
        lost.sort();
        let mut expected = vec![n1, far];
        expected.sort();
        assert_eq!(lost, expected);
        assert!(router.lookup_route(&far).is_none());
    }

    #[tokio::test]
    async fn test_route_metrics() {
        let (router, _transport) = make_router("ME");
        let n1 = addr("N1");
        router.add_neighbor(n1, -50.0, unix_now());

        let metrics = router.get_route_metrics(&n1).unwrap();
        assert_eq!(metrics.hop_count, 1);
        assert_eq!(metrics.link_quality, 67);
        assert_eq!(metrics.metric, 50);
        assert!(router.get_route_metrics(&addr("UNKNOWN")).is_none());
    }
}
