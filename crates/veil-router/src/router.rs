//! Router orchestration
//!
//! Ties local destinations, transit participation and garlic together.
//! Everything a received message causes is processed iteratively from one
//! work queue: messages addressed back to this router are pushed onto the
//! queue instead of being handled recursively.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use veil_crypto::{RouterIdentity, X25519StaticSecret};
use veil_garlic::{Clove, CloveDelivery, CloveHandler, GarlicProcessor, Recipient};
use veil_netdb::{PathSelector, PeerStore};
use veil_protocol::types::now_millis;
use veil_protocol::{
    Direction, I2npMessage, I2npMessageType, IdentHash, ShortTunnelBuild, TunnelDataMessage,
    TunnelDelivery, TunnelId,
};
use veil_tunnel::{
    handle_build_request, OutgoingBuild, PoolStats, TransitAction, TransitTable, TunnelError, TunnelPool,
    TunnelSend, TunnelSummary,
};

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::lease::{Lease, LeaseSet, LocalDestination};
use crate::shard::DestinationShard;
use crate::traits::{Application, NetDb, Transport};

/// Router counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct RouterStats {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub transit_forwarded: u64,
    pub builds_sent: u64,
    pub build_requests_handled: u64,
    pub payloads_delivered: u64,
    pub payloads_sent: u64,
}

/// One step of message processing
enum Work {
    /// A message arriving at this router
    Message { from: IdentHash, message: I2npMessage },
    /// A message that came out of one of our inbound tunnels
    Deliver {
        destination: IdentHash,
        message: I2npMessage,
    },
    /// A message to route per tunnel delivery instructions
    Endpoint {
        delivery: TunnelDelivery,
        message: I2npMessage,
    },
    Send { to: IdentHash, message: I2npMessage },
}

enum CloveAction {
    Local(Option<IdentHash>, I2npMessage),
    Tunnel(IdentHash, TunnelId, I2npMessage),
    Router(IdentHash, I2npMessage),
}

/// Collects unwrapped cloves so they can be queued as work
#[derive(Default)]
struct CloveCollector {
    actions: std::sync::Mutex<Vec<CloveAction>>,
}

impl CloveCollector {
    fn push(&self, action: CloveAction) {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }

    fn take(self) -> Vec<CloveAction> {
        self.actions.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CloveHandler for CloveCollector {
    async fn deliver_local(&self, destination: Option<IdentHash>, message: I2npMessage) {
        self.push(CloveAction::Local(destination, message));
    }

    async fn forward_to_tunnel(&self, gateway: IdentHash, tunnel_id: TunnelId, message: I2npMessage) {
        self.push(CloveAction::Tunnel(gateway, tunnel_id, message));
    }

    async fn forward_to_router(&self, router: IdentHash, message: I2npMessage) {
        self.push(CloveAction::Router(router, message));
    }
}

type Shard = Arc<Mutex<DestinationShard>>;

pub struct Router {
    identity: RouterIdentity,
    local: IdentHash,
    config: RouterConfig,
    store: Arc<PeerStore>,
    netdb: Arc<dyn NetDb>,
    transport: Arc<dyn Transport>,
    application: Arc<dyn Application>,
    garlic: GarlicProcessor,
    transit: Mutex<TransitTable>,
    shards: DashMap<IdentHash, Shard>,
    destinations: DashMap<IdentHash, Arc<LocalDestination>>,
    /// Our inbound tunnel id -> owning destination
    inbound_index: DashMap<TunnelId, IdentHash>,
    /// Build attempt id -> owning destination
    pending_builds: DashMap<u32, IdentHash>,
    /// Tunnel test id -> owning destination
    pending_tests: DashMap<u32, IdentHash>,
    lease_sets: DashMap<IdentHash, LeaseSet>,
    /// Recently failed peers and when they may be used again
    exclusion: StdRwLock<Arc<HashMap<IdentHash, u64>>>,
    stats: RwLock<RouterStats>,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl Router {
    pub fn new(
        identity: RouterIdentity,
        config: RouterConfig,
        store: Arc<PeerStore>,
        netdb: Arc<dyn NetDb>,
        transport: Arc<dyn Transport>,
        application: Arc<dyn Application>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let local = IdentHash::from_bytes(identity.ident_hash());

        Ok(Arc::new(Router {
            identity,
            local,
            garlic: GarlicProcessor::new(config.garlic.clone()),
            transit: Mutex::new(TransitTable::new(config.transit.max_tunnels)),
            config,
            store,
            netdb,
            transport,
            application,
            shards: DashMap::new(),
            destinations: DashMap::new(),
            inbound_index: DashMap::new(),
            pending_builds: DashMap::new(),
            pending_tests: DashMap::new(),
            lease_sets: DashMap::new(),
            exclusion: StdRwLock::new(Arc::new(HashMap::new())),
            stats: RwLock::new(RouterStats::default()),
            shutdown_tx,
            tasks: RwLock::new(Vec::new()),
        }))
    }

    pub fn local_ident(&self) -> IdentHash {
        self.local
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PeerStore> {
        &self.store
    }

    pub fn garlic(&self) -> &GarlicProcessor {
        &self.garlic
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }

    pub async fn transit_count(&self) -> usize {
        self.transit.lock().await.len()
    }

    fn shard(&self, destination: &IdentHash) -> Option<Shard> {
        self.shards.get(destination).map(|s| Arc::clone(s.value()))
    }

    fn shard_handles(&self) -> Vec<(IdentHash, Shard)> {
        self.shards
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    pub fn destination_idents(&self) -> Vec<IdentHash> {
        self.shards.iter().map(|e| *e.key()).collect()
    }

    /// Host a destination; its tunnels are built on the next reconciliation
    pub fn add_destination(&self, secret: X25519StaticSecret) -> Result<IdentHash> {
        let destination = Arc::new(LocalDestination::new(secret));
        let ident = destination.ident;
        let selector = PathSelector::new(Arc::clone(&self.store), self.local);
        let pool = TunnelPool::new(ident, self.config.tunnels.clone(), selector, self.local)?;

        self.destinations.insert(ident, Arc::clone(&destination));
        self.shards.insert(
            ident,
            Arc::new(Mutex::new(DestinationShard::new(
                destination,
                pool,
                self.config.outbound_queue_capacity,
            ))),
        );
        info!("Added destination {}", ident);
        Ok(ident)
    }

    /// Stop hosting a destination, cancelling its builds
    pub async fn remove_destination(&self, destination: &IdentHash) -> bool {
        let Some((_, shard)) = self.shards.remove(destination) else {
            return false;
        };
        self.destinations.remove(destination);
        let cancelled = shard.lock().await.pool.shutdown();
        self.inbound_index.retain(|_, d| *d != *destination);
        self.pending_builds.retain(|_, d| *d != *destination);
        self.pending_tests.retain(|_, d| *d != *destination);
        debug!("Removed destination {} ({} builds cancelled)", destination, cancelled);
        true
    }

    /// Current lease set of a local destination
    pub async fn lease_set(&self, destination: &IdentHash) -> Option<LeaseSet> {
        let shard = self.shard(destination)?;
        let shard = shard.lock().await;
        let now = now_millis();
        let leases = shard
            .pool
            .inbound_ids()
            .into_iter()
            .filter_map(|id| shard.pool.tunnel(Direction::Inbound, id))
            .filter(|t| t.is_established() && !t.is_expiring(now))
            .map(|t| {
                let (gateway, tunnel_id) = t.gateway();
                Lease {
                    gateway,
                    tunnel_id,
                    expires: t.expires(),
                }
            })
            .collect();
        Some(LeaseSet {
            destination: *destination,
            encryption_key: shard.destination.public,
            leases,
        })
    }

    /// Remember how to reach a remote destination
    pub fn learn_lease_set(&self, lease_set: LeaseSet) {
        self.lease_sets.insert(lease_set.destination, lease_set);
    }

    pub async fn tunnel_summaries(&self, destination: &IdentHash) -> Vec<TunnelSummary> {
        match self.shard(destination) {
            Some(shard) => shard.lock().await.pool.summaries(),
            None => Vec::new(),
        }
    }

    pub async fn pool_stats(&self, destination: &IdentHash) -> Option<PoolStats> {
        let shard = self.shard(destination)?;
        let stats = shard.lock().await.pool.stats().clone();
        Some(stats)
    }

    /// Live tunnels of a local destination in one direction
    pub async fn live_tunnels(&self, destination: &IdentHash, direction: Direction) -> usize {
        match self.shard(destination) {
            Some(shard) => shard.lock().await.pool.live_count(direction, now_millis()),
            None => 0,
        }
    }

    /// `Degraded` when a destination has given up on building for now
    pub async fn destination_status(&self, destination: &IdentHash) -> Result<()> {
        let shard = self
            .shard(destination)
            .ok_or(RouterError::UnknownDestination(*destination))?;
        if shard.lock().await.pool.is_degraded() {
            return Err(RouterError::Degraded(*destination));
        }
        Ok(())
    }

    pub async fn reconfigure(
        &self,
        destination: &IdentHash,
        inbound_hops: usize,
        outbound_hops: usize,
        inbound_quantity: usize,
        outbound_quantity: usize,
    ) -> Result<()> {
        let shard = self
            .shard(destination)
            .ok_or(RouterError::UnknownDestination(*destination))?;
        shard.lock().await.pool.reconfigure(
            inbound_hops,
            outbound_hops,
            inbound_quantity,
            outbound_quantity,
        )?;
        Ok(())
    }

    pub async fn set_explicit_peers(&self, destination: &IdentHash, peers: Vec<IdentHash>) -> Result<()> {
        let shard = self
            .shard(destination)
            .ok_or(RouterError::UnknownDestination(*destination))?;
        shard.lock().await.pool.set_explicit_peers(peers)?;
        Ok(())
    }

    /// Count undelivered application traffic against an outbound tunnel
    pub async fn report_delivery_failure(&self, destination: &IdentHash, tunnel_id: TunnelId) -> Result<()> {
        let shard = self
            .shard(destination)
            .ok_or(RouterError::UnknownDestination(*destination))?;
        shard.lock().await.pool.report_delivery_failure(tunnel_id);
        Ok(())
    }

    // Exclusion snapshot

    fn exclusion_snapshot(&self) -> Arc<HashMap<IdentHash, u64>> {
        Arc::clone(&self.exclusion.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn update_exclusion<F>(&self, f: F)
    where
        F: FnOnce(&mut HashMap<IdentHash, u64>),
    {
        let mut guard = self.exclusion.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    fn exclude_peers(&self, peers: Vec<IdentHash>, now: u64) {
        if peers.is_empty() {
            return;
        }
        let until = now + self.config.exclusion_secs * 1000;
        self.update_exclusion(|set| {
            for peer in peers {
                set.insert(peer, until);
            }
        });
    }

    pub fn excluded_peers(&self) -> HashSet<IdentHash> {
        self.exclusion_snapshot().keys().copied().collect()
    }

    fn sync_inbound_index(&self, destination: IdentHash, pool: &TunnelPool) {
        let ids: HashSet<TunnelId> = pool.inbound_ids().into_iter().collect();
        self.inbound_index
            .retain(|id, d| *d != destination || ids.contains(id));
        for id in ids {
            self.inbound_index.insert(id, destination);
        }
    }

    // Pool management

    /// Reconcile every destination's pool and send the resulting builds
    pub async fn reconcile_all(&self, now: u64) -> usize {
        let exclusion = self.excluded_peers();
        let mut sent = 0;

        for (destination, shard) in self.shard_handles() {
            let builds = {
                let mut shard = shard.lock().await;
                let builds = shard.pool.reconcile(now, &exclusion);
                self.sync_inbound_index(destination, &shard.pool);
                builds
            };
            for build in builds {
                if self.send_build(destination, &shard, build, now).await {
                    sent += 1;
                }
            }
        }
        sent
    }

    async fn send_build(&self, destination: IdentHash, shard: &Shard, build: OutgoingBuild, now: u64) -> bool {
        self.pending_builds.insert(build.attempt_id, destination);
        if let Some((tag, key)) = build.reply_key {
            self.garlic.register_one_time_key(tag, key).await;
        }

        let bytes = match build.message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize build {}: {}", build.attempt_id, e);
                return false;
            }
        };

        match self.transport.send_encrypted(&build.first_hop, bytes).await {
            Ok(()) => {
                self.stats.write().await.builds_sent += 1;
                true
            }
            Err(e) => {
                debug!("Build {} not sent: {}", build.attempt_id, e);
                self.store.record_transport_failure(&build.first_hop);
                self.pending_builds.remove(&build.attempt_id);
                let mut shard = shard.lock().await;
                shard.pool.fail_build(build.attempt_id, build.first_hop, now);
                self.exclude_peers(shard.pool.take_failed_peers(), now);
                false
            }
        }
    }

    /// Time out builds and tests past their deadlines
    pub async fn sweep_all(&self, now: u64) -> usize {
        let mut timed_out = 0;
        for (destination, shard) in self.shard_handles() {
            let mut shard = shard.lock().await;
            timed_out += shard.pool.sweep(now);
            self.pending_builds
                .retain(|id, d| *d != destination || shard.pool.is_building(*id));
            self.pending_tests
                .retain(|id, d| *d != destination || shard.pool.is_testing(*id));
            self.exclude_peers(shard.pool.take_failed_peers(), now);
            self.sync_inbound_index(destination, &shard.pool);
        }
        timed_out
    }

    /// Send a test message through every testable outbound tunnel
    pub async fn run_tests(&self, now: u64) -> usize {
        let mut queue = VecDeque::new();
        let mut started = 0;
        for (destination, shard) in self.shard_handles() {
            let tests = shard.lock().await.pool.start_tests(now);
            for test in tests {
                self.pending_tests.insert(test.test_id, destination);
                started += 1;
                for send in test.sends {
                    queue.push_back(Self::tunnel_send_work(send));
                }
            }
        }
        self.run(queue).await;
        started
    }

    /// Housekeeping: sessions, transit tunnels, exclusions, peers
    pub async fn maintain(&self, now: u64) {
        let sessions = self.garlic.cleanup().await;
        let transit = self.transit.lock().await.expire(now);
        self.update_exclusion(|set| set.retain(|_, until| *until > now));
        let peers = self.store.expire(now / 1000);

        let cutoff = now.saturating_sub(self.config.tunnels.lifetime_secs * 1000);
        for (_, shard) in self.shard_handles() {
            let dropped = shard.lock().await.drop_older_than(cutoff);
            if dropped > 0 {
                debug!("Dropped {} stale queued messages", dropped);
            }
        }

        if self.store.len() < self.config.min_known_peers {
            let wanted = self.config.min_known_peers - self.store.len();
            match self.store.refresh(self.netdb.as_ref(), wanted).await {
                Ok(0) => {}
                Ok(added) => debug!("Learned {} peers from the network database", added),
                Err(e) => warn!("Peer refresh failed: {}", e),
            }
        }
        trace!(
            "Maintenance: {} sessions, {} transit tunnels, {} peers expired",
            sessions,
            transit,
            peers
        );
    }

    // Outbound traffic

    /// Queue a payload from a local destination to a remote one
    ///
    /// The payload goes out right away when a tunnel is ready, and stays
    /// queued otherwise. The remote lease set must already be known.
    pub async fn submit_outbound(&self, from: &IdentHash, to: &IdentHash, payload: Vec<u8>) -> Result<()> {
        let shard = self
            .shard(from)
            .ok_or(RouterError::UnknownDestination(*from))?;
        if !self.lease_sets.contains_key(to) {
            return Err(RouterError::NoLeaseSet(*to));
        }
        shard.lock().await.enqueue(*to, payload, now_millis())?;
        self.flush_outbound(from).await;
        Ok(())
    }

    /// Send as much of a destination's queue as its tunnels allow
    pub async fn flush_outbound(&self, from: &IdentHash) -> usize {
        let Some(shard) = self.shard(from) else {
            return 0;
        };
        let now = now_millis();
        let mut queue = VecDeque::new();
        let mut sent = 0;

        {
            let mut shard = shard.lock().await;
            while let Some(queued) = shard.pop() {
                let target = self
                    .lease_sets
                    .get(&queued.to)
                    .and_then(|ls| ls.pick(now).map(|lease| (lease, ls.encryption_key)));
                let Some((lease, key)) = target else {
                    debug!("No usable lease for {}; dropping message", queued.to);
                    self.stats.write().await.messages_dropped += 1;
                    continue;
                };
                // Handshakes are acknowledged back through one of our inbound tunnels
                let reply = shard.pool.select_inbound(now).map(|t| {
                    let (gateway, tunnel_id) = t.gateway();
                    CloveDelivery::Tunnel { gateway, tunnel_id }
                });
                let Some(tunnel) = shard.pool.select_outbound(now, None) else {
                    shard.requeue(queued);
                    break;
                };

                let data = I2npMessage::new(I2npMessageType::Data, queued.payload);
                let clove = Clove::new(CloveDelivery::Destination(queued.to), data);
                let sends = self
                    .garlic
                    .wrap_for_destination(queued.to, &key, &[clove], reply)
                    .map_err(RouterError::from)
                    .and_then(|garlic| {
                        let delivery = TunnelDelivery::Tunnel {
                            gateway: lease.gateway,
                            tunnel_id: lease.tunnel_id,
                        };
                        tunnel
                            .wrap_outbound(vec![(delivery, garlic)])
                            .map_err(RouterError::from)
                    });

                match sends {
                    Ok(sends) => {
                        queue.extend(sends.into_iter().map(Self::tunnel_send_work));
                        sent += 1;
                    }
                    Err(e) => {
                        warn!("Could not wrap message for {}: {}", queued.to, e);
                        self.stats.write().await.messages_dropped += 1;
                    }
                }
            }
        }

        self.stats.write().await.payloads_sent += sent as u64;
        self.run(queue).await;
        sent
    }

    fn tunnel_send_work(send: TunnelSend) -> Work {
        match send {
            TunnelSend::Hop { to, message } => Work::Send { to, message },
            TunnelSend::Local { delivery, message } => Work::Endpoint { delivery, message },
        }
    }

    // Inbound traffic

    /// Entry point for bytes received from a peer
    pub async fn on_receive(&self, from: IdentHash, bytes: &[u8]) {
        self.stats.write().await.messages_received += 1;
        self.store.record_transport_success(&from);
        match I2npMessage::from_bytes(bytes) {
            Ok((message, _)) => {
                let mut queue = VecDeque::new();
                queue.push_back(Work::Message { from, message });
                self.run(queue).await;
            }
            Err(e) => {
                debug!("Dropping unparseable message: {}", e);
                self.stats.write().await.messages_dropped += 1;
            }
        }
    }

    async fn run(&self, mut queue: VecDeque<Work>) {
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Message { from, message } => self.handle_message(from, message, &mut queue).await,
                Work::Deliver {
                    destination,
                    message,
                } => self.handle_delivered(destination, message, &mut queue).await,
                Work::Endpoint { delivery, message } => match delivery {
                    TunnelDelivery::Local => queue.push_back(Work::Message {
                        from: self.local,
                        message,
                    }),
                    TunnelDelivery::Router(to) => queue.push_back(Work::Send { to, message }),
                    TunnelDelivery::Tunnel { gateway, tunnel_id } => {
                        match I2npMessage::tunnel_gateway(tunnel_id, &message) {
                            Ok(wrapped) => queue.push_back(Work::Send {
                                to: gateway,
                                message: wrapped,
                            }),
                            Err(e) => debug!("Cannot wrap for tunnel {}: {}", tunnel_id, e),
                        }
                    }
                },
                Work::Send { to, message } if to == self.local => {
                    queue.push_back(Work::Message {
                        from: self.local,
                        message,
                    });
                }
                Work::Send { to, message } => self.send(to, message).await,
            }
        }
    }

    async fn send(&self, to: IdentHash, message: I2npMessage) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Cannot serialize message for {}: {}", to, e);
                return;
            }
        };
        match self.transport.send_encrypted(&to, bytes).await {
            Ok(()) => self.stats.write().await.messages_sent += 1,
            Err(e) => {
                debug!("Send failed: {}", e);
                self.store.record_transport_failure(&to);
                self.stats.write().await.send_failures += 1;
            }
        }
    }

    async fn drop_message(&self, reason: &str, message: &I2npMessage) {
        debug!("Dropping {:?} message {}: {}", message.msg_type, message.msg_id, reason);
        self.stats.write().await.messages_dropped += 1;
    }

    async fn handle_message(&self, from: IdentHash, message: I2npMessage, queue: &mut VecDeque<Work>) {
        let now = now_millis();
        if message.is_expired(now) {
            self.drop_message("expired", &message).await;
            return;
        }

        match message.msg_type {
            I2npMessageType::ShortTunnelBuild if self.pending_builds.contains_key(&message.msg_id) => {
                self.handle_build_reply(message, now).await;
            }
            I2npMessageType::ShortTunnelBuildReply => {
                self.handle_build_reply(message, now).await;
            }
            I2npMessageType::ShortTunnelBuild => self.handle_build_request(message, now, queue).await,
            I2npMessageType::Garlic => {
                let collector = CloveCollector::default();
                self.garlic
                    .handle_message(
                        Recipient::Router(self.identity.encryption_secret()),
                        &message,
                        &collector,
                    )
                    .await;
                self.queue_cloves(None, collector.take(), queue);
            }
            I2npMessageType::TunnelData => self.handle_tunnel_data(message, now, queue).await,
            I2npMessageType::TunnelGateway => self.handle_tunnel_gateway(message, queue).await,
            I2npMessageType::DeliveryStatus => self.handle_delivery_status(&message).await,
            I2npMessageType::Data => {
                trace!("Data message from {} outside any destination", from);
                self.drop_message("no destination", &message).await;
            }
        }
    }

    async fn handle_build_request(&self, message: I2npMessage, now: u64, queue: &mut VecDeque<Work>) {
        let build = match ShortTunnelBuild::from_bytes(&message.payload) {
            Ok(build) => build,
            Err(e) => {
                self.drop_message(&e.to_string(), &message).await;
                return;
            }
        };

        let response = {
            let mut transit = self.transit.lock().await;
            handle_build_request(&self.identity, &mut transit, build, now)
        };
        match response {
            Ok(response) => {
                self.stats.write().await.build_requests_handled += 1;
                queue.push_back(Work::Send {
                    to: response.to,
                    message: response.message,
                });
            }
            Err(e) => self.drop_message(&e.to_string(), &message).await,
        }
    }

    async fn handle_build_reply(&self, message: I2npMessage, now: u64) {
        let Some((attempt_id, destination)) = self.pending_builds.remove(&message.msg_id) else {
            self.drop_message("unknown build reply", &message).await;
            return;
        };
        let Some(shard) = self.shard(&destination) else {
            return;
        };
        let records = match ShortTunnelBuild::from_bytes(&message.payload) {
            Ok(build) => build.records,
            Err(e) => {
                self.drop_message(&e.to_string(), &message).await;
                return;
            }
        };

        let mut shard = shard.lock().await;
        match shard.pool.handle_build_reply(attempt_id, records, now) {
            Some(Ok(_)) => self.sync_inbound_index(destination, &shard.pool),
            Some(Err(e)) => {
                debug!("Build {} for {} failed: {}", attempt_id, destination, e);
                self.exclude_peers(shard.pool.take_failed_peers(), now);
            }
            None => trace!("Late reply for build {}", attempt_id),
        }
    }

    async fn handle_tunnel_data(&self, message: I2npMessage, now: u64, queue: &mut VecDeque<Work>) {
        let data = match TunnelDataMessage::from_bytes(&message.payload) {
            Ok(data) => data,
            Err(e) => {
                self.drop_message(&e.to_string(), &message).await;
                return;
            }
        };

        let owner = self.inbound_index.get(&data.tunnel_id).map(|d| *d);
        if let Some(destination) = owner {
            let Some(shard) = self.shard(&destination) else {
                return;
            };
            let delivered = shard
                .lock()
                .await
                .pool
                .handle_inbound_data(data.tunnel_id, data.block, now);
            match delivered {
                Ok(messages) => {
                    for (delivery, message) in messages {
                        match delivery {
                            TunnelDelivery::Local => queue.push_back(Work::Deliver {
                                destination,
                                message,
                            }),
                            other => queue.push_back(Work::Endpoint {
                                delivery: other,
                                message,
                            }),
                        }
                    }
                }
                Err(e) => debug!("Inbound tunnel {} dropped a block: {}", data.tunnel_id, e),
            }
            return;
        }

        let actions = self.transit.lock().await.handle_tunnel_data(&data, now);
        match actions {
            Ok(actions) => self.queue_transit(actions, queue).await,
            Err(TunnelError::UnknownTunnel(id)) => {
                trace!("No tunnel {}", id);
                self.stats.write().await.messages_dropped += 1;
            }
            Err(e) => debug!("Transit tunnel {} dropped a block: {}", data.tunnel_id, e),
        }
    }

    async fn handle_tunnel_gateway(&self, message: I2npMessage, queue: &mut VecDeque<Work>) {
        let (tunnel_id, inner) = match message.parse_tunnel_gateway() {
            Ok(parsed) => parsed,
            Err(e) => {
                self.drop_message(&e.to_string(), &message).await;
                return;
            }
        };

        // Our own zero-hop inbound tunnel
        let owner = self.inbound_index.get(&tunnel_id).map(|d| *d);
        if let Some(destination) = owner {
            queue.push_back(Work::Deliver {
                destination,
                message: inner,
            });
            return;
        }

        let actions = self.transit.lock().await.handle_tunnel_gateway(tunnel_id, inner);
        match actions {
            Ok(actions) => self.queue_transit(actions, queue).await,
            Err(e) => {
                trace!("Gateway message for {} dropped: {}", tunnel_id, e);
                self.stats.write().await.messages_dropped += 1;
            }
        }
    }

    async fn queue_transit(&self, actions: Vec<TransitAction>, queue: &mut VecDeque<Work>) {
        let forwarded = actions.len() as u64;
        for action in actions {
            match action {
                TransitAction::Forward { to, message } => queue.push_back(Work::Send { to, message }),
                TransitAction::Deliver { delivery, message } => {
                    queue.push_back(Work::Endpoint { delivery, message })
                }
            }
        }
        self.stats.write().await.transit_forwarded += forwarded;
    }

    async fn handle_delivery_status(&self, message: &I2npMessage) {
        let Ok(test_id) = message.parse_delivery_status() else {
            self.drop_message("short delivery status", message).await;
            return;
        };
        let Some((_, destination)) = self.pending_tests.remove(&test_id) else {
            if !self.garlic.confirm_session(test_id) {
                trace!("Unsolicited delivery status {}", test_id);
            }
            return;
        };
        if let Some(shard) = self.shard(&destination) {
            shard.lock().await.pool.handle_delivery_status(test_id);
        }
    }

    /// A message that came out of one of `destination`'s inbound tunnels
    async fn handle_delivered(&self, destination: IdentHash, message: I2npMessage, queue: &mut VecDeque<Work>) {
        if message.is_expired(now_millis()) {
            self.drop_message("expired", &message).await;
            return;
        }

        match message.msg_type {
            I2npMessageType::Garlic => {
                let Some(local) = self.destinations.get(&destination).map(|d| Arc::clone(d.value())) else {
                    return;
                };
                let collector = CloveCollector::default();
                self.garlic
                    .handle_message(Recipient::Destination(&local.secret), &message, &collector)
                    .await;
                self.queue_cloves(Some(destination), collector.take(), queue);
            }
            I2npMessageType::Data => {
                self.stats.write().await.payloads_delivered += 1;
                self.application
                    .deliver_local(destination, message.payload)
                    .await;
            }
            I2npMessageType::DeliveryStatus => self.handle_delivery_status(&message).await,
            _ => self.drop_message("not deliverable to a destination", &message).await,
        }
    }

    /// Turn unwrapped cloves into work
    ///
    /// `context` is the destination whose key opened the garlic, if any.
    fn queue_cloves(&self, context: Option<IdentHash>, actions: Vec<CloveAction>, queue: &mut VecDeque<Work>) {
        for action in actions {
            match action {
                CloveAction::Local(target, message) => match (target, context) {
                    (Some(target), _) if self.destinations.contains_key(&target) => {
                        queue.push_back(Work::Deliver {
                            destination: target,
                            message,
                        })
                    }
                    (Some(target), _) => debug!("Clove for destination {} not hosted here", target),
                    (None, Some(destination)) => queue.push_back(Work::Deliver {
                        destination,
                        message,
                    }),
                    (None, None) => queue.push_back(Work::Message {
                        from: self.local,
                        message,
                    }),
                },
                CloveAction::Tunnel(gateway, tunnel_id, message) => queue.push_back(Work::Endpoint {
                    delivery: TunnelDelivery::Tunnel { gateway, tunnel_id },
                    message,
                }),
                CloveAction::Router(to, message) => queue.push_back(Work::Send { to, message }),
            }
        }
    }

    /// Cancel every build, drop tunnels and forget all session keys
    pub(crate) async fn clear(&self) {
        let mut cancelled = 0;
        for (_, shard) in self.shard_handles() {
            cancelled += shard.lock().await.pool.shutdown();
        }
        self.pending_builds.clear();
        self.pending_tests.clear();
        self.inbound_index.clear();
        self.transit.lock().await.clear();
        self.garlic.clear().await;
        info!("Router {} stopped ({} builds cancelled)", self.local, cancelled);
    }
}
