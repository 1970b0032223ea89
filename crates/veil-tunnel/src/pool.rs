//! Per-destination tunnel pool
//!
//! Keeps target counts of inbound and outbound tunnels alive. Reconciliation
//! is idempotent: it only emits builds for the gap between the target and
//! live plus pending tunnels, so calling it repeatedly without a state change
//! starts nothing new.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use veil_netdb::{BuildOutcome, NetDbError, PathSelector, SharedRecord, MAX_TUNNEL_HOPS};
use veil_protocol::build::BuildRecord;
use veil_protocol::types::random_msg_id;
use veil_protocol::{Direction, I2npMessage, IdentHash, TunnelDelivery, TunnelId};

use crate::builder::{BuildCompletion, OutgoingBuild, TunnelBuilder};
use crate::error::{Result, TunnelError};
use crate::tunnel::{Tunnel, TunnelSend, TunnelState, TUNNEL_RECREATION_THRESHOLD_MS};

/// Most tunnels a pool keeps per direction
pub const MAX_TUNNELS_PER_DIRECTION: usize = 16;

fn default_hops() -> usize {
    3
}

fn default_quantity() -> usize {
    2
}

fn default_lifetime_secs() -> u64 {
    660
}

fn default_build_timeout_secs() -> u64 {
    30
}

fn default_max_build_attempts() -> u32 {
    5
}

fn default_ack_failure_threshold() -> u32 {
    2
}

fn default_manage_interval_secs() -> u64 {
    10
}

fn default_test_interval_secs() -> u64 {
    30
}

fn default_test_timeout_secs() -> u64 {
    10
}

fn default_backoff_initial_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    60
}

/// Tunnel pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_hops")]
    pub inbound_hops: usize,

    #[serde(default = "default_hops")]
    pub outbound_hops: usize,

    #[serde(default = "default_quantity")]
    pub inbound_quantity: usize,

    #[serde(default = "default_quantity")]
    pub outbound_quantity: usize,

    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,

    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// Consecutive failed builds before the destination is degraded
    #[serde(default = "default_max_build_attempts")]
    pub max_build_attempts: u32,

    /// Missed acknowledgments before a tunnel is failed
    #[serde(default = "default_ack_failure_threshold")]
    pub ack_failure_threshold: u32,

    #[serde(default = "default_manage_interval_secs")]
    pub manage_interval_secs: u64,

    #[serde(default = "default_test_interval_secs")]
    pub test_interval_secs: u64,

    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Hex ident hashes used in order instead of random selection
    #[serde(default)]
    pub explicit_peers: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            inbound_hops: default_hops(),
            outbound_hops: default_hops(),
            inbound_quantity: default_quantity(),
            outbound_quantity: default_quantity(),
            lifetime_secs: default_lifetime_secs(),
            build_timeout_secs: default_build_timeout_secs(),
            max_build_attempts: default_max_build_attempts(),
            ack_failure_threshold: default_ack_failure_threshold(),
            manage_interval_secs: default_manage_interval_secs(),
            test_interval_secs: default_test_interval_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            explicit_peers: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inbound_hops > MAX_TUNNEL_HOPS || self.outbound_hops > MAX_TUNNEL_HOPS {
            return Err(TunnelError::InvalidConfig(format!(
                "hop count above {}",
                MAX_TUNNEL_HOPS
            )));
        }
        if self.inbound_quantity > MAX_TUNNELS_PER_DIRECTION
            || self.outbound_quantity > MAX_TUNNELS_PER_DIRECTION
        {
            return Err(TunnelError::InvalidConfig(format!(
                "quantity above {}",
                MAX_TUNNELS_PER_DIRECTION
            )));
        }
        let usable_ms = (self.lifetime_secs * 1000).saturating_sub(TUNNEL_RECREATION_THRESHOLD_MS);
        if self.build_timeout_secs * 1000 >= usable_ms {
            return Err(TunnelError::InvalidConfig(
                "build timeout must be shorter than the usable tunnel lifetime".to_string(),
            ));
        }
        if self.max_build_attempts == 0 || self.ack_failure_threshold == 0 {
            return Err(TunnelError::InvalidConfig(
                "attempt and failure thresholds must be positive".to_string(),
            ));
        }
        self.explicit_peer_hashes()?;
        Ok(())
    }

    pub fn explicit_peer_hashes(&self) -> Result<Vec<IdentHash>> {
        let peers = self
            .explicit_peers
            .iter()
            .map(|s| IdentHash::from_hex(s).map_err(TunnelError::InvalidConfig))
            .collect::<Result<Vec<_>>>()?;
        check_distinct(&peers)?;
        Ok(peers)
    }

    pub fn hops(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound_hops,
            Direction::Outbound => self.outbound_hops,
        }
    }

    pub fn quantity(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound_quantity,
            Direction::Outbound => self.outbound_quantity,
        }
    }

    fn lifetime_ms(&self) -> u64 {
        self.lifetime_secs * 1000
    }
}

/// A hop may appear only once in a tunnel, so explicit peers must be distinct
fn check_distinct(peers: &[IdentHash]) -> Result<()> {
    let mut seen = HashSet::with_capacity(peers.len());
    match peers.iter().find(|p| !seen.insert(**p)) {
        Some(dup) => Err(TunnelError::InvalidConfig(format!(
            "explicit peer {} listed twice",
            dup
        ))),
        None => Ok(()),
    }
}

/// Pool counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolStats {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_rejected: u64,
    pub builds_timed_out: u64,
    pub builds_unreachable: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub tunnels_failed: u64,
}

/// Read-only view of one tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSummary {
    pub id: TunnelId,
    pub direction: Direction,
    pub state: String,
    pub hops: Vec<IdentHash>,
    pub expires: u64,
}

/// A DeliveryStatus test through an outbound tunnel back in an inbound one
#[derive(Debug)]
pub struct TunnelTest {
    pub test_id: u32,
    pub outbound: TunnelId,
    pub inbound: TunnelId,
    pub sends: Vec<TunnelSend>,
}

#[derive(Debug)]
struct PendingTest {
    outbound: TunnelId,
    inbound: TunnelId,
    deadline: u64,
}

#[derive(Debug, Default)]
struct DirectionState {
    tunnels: HashMap<TunnelId, Tunnel>,
    consecutive_failures: u32,
    degraded: bool,
    backoff_until: u64,
    backoff_ms: u64,
    round_robin: usize,
}

impl DirectionState {
    fn is_selectable(tunnel: &Tunnel, now: u64) -> bool {
        tunnel.is_established() && !tunnel.is_expiring(now)
    }

    fn live_count(&self, now: u64) -> usize {
        self.tunnels
            .values()
            .filter(|t| {
                matches!(t.state(), TunnelState::Established | TunnelState::TestFailed)
                    && !t.is_expiring(now)
            })
            .count()
    }

    fn bump_backoff(&mut self, now: u64, initial_ms: u64, max_ms: u64) {
        self.backoff_ms = if self.backoff_ms == 0 {
            initial_ms
        } else {
            (self.backoff_ms * 2).min(max_ms)
        };
        self.backoff_until = now + self.backoff_ms;
    }

    fn reset_backoff(&mut self) {
        self.backoff_ms = 0;
        self.backoff_until = 0;
    }

    /// Least recently used selectable tunnel, ties in turn
    fn select(&mut self, now: u64, exclude: Option<TunnelId>) -> Option<TunnelId> {
        let candidates: Vec<(TunnelId, u64)> = self
            .tunnels
            .values()
            .filter(|t| Self::is_selectable(t, now) && Some(t.id()) != exclude)
            .map(|t| (t.id(), t.last_used))
            .collect();
        let oldest = candidates.iter().map(|(_, used)| *used).min()?;

        let mut tied: Vec<TunnelId> = candidates
            .into_iter()
            .filter(|(_, used)| *used == oldest)
            .map(|(id, _)| id)
            .collect();
        tied.sort_unstable();
        let id = tied[self.round_robin % tied.len()];
        self.round_robin = self.round_robin.wrapping_add(1);

        if let Some(tunnel) = self.tunnels.get_mut(&id) {
            tunnel.last_used = now;
        }
        Some(id)
    }
}

/// Tunnels and in-flight builds for one destination
#[derive(Debug)]
pub struct TunnelPool {
    destination: IdentHash,
    local: IdentHash,
    config: PoolConfig,
    explicit_peers: Vec<IdentHash>,
    selector: PathSelector,
    builder: TunnelBuilder,
    inbound: DirectionState,
    outbound: DirectionState,
    tests: HashMap<u32, PendingTest>,
    failed_peers: Vec<IdentHash>,
    stats: PoolStats,
}

impl TunnelPool {
    pub fn new(destination: IdentHash, config: PoolConfig, selector: PathSelector, local: IdentHash) -> Result<Self> {
        config.validate()?;
        let explicit_peers = config.explicit_peer_hashes()?;
        let builder = TunnelBuilder::new(local, config.build_timeout_secs * 1000, config.lifetime_ms());
        Ok(TunnelPool {
            destination,
            local,
            config,
            explicit_peers,
            selector,
            builder,
            inbound: DirectionState::default(),
            outbound: DirectionState::default(),
            tests: HashMap::new(),
            failed_peers: Vec::new(),
            stats: PoolStats::default(),
        })
    }

    pub fn destination(&self) -> IdentHash {
        self.destination
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn side(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    fn side_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }

    /// Bring both directions towards their targets
    ///
    /// `exclusion` holds peers the caller wants kept out of new paths.
    pub fn reconcile(&mut self, now: u64, exclusion: &HashSet<IdentHash>) -> Vec<OutgoingBuild> {
        let mut builds = Vec::new();
        for direction in [Direction::Inbound, Direction::Outbound] {
            self.retire(direction, now);
            self.recreate_expiring(direction, now, &mut builds);
            self.fill(direction, now, exclusion, &mut builds);
        }
        builds
    }

    fn retire(&mut self, direction: Direction, now: u64) {
        let side = self.side_mut(direction);
        side.tunnels
            .retain(|_, t| !t.is_expired(now) && t.state() != TunnelState::Failed);
        for tunnel in side.tunnels.values_mut() {
            if tunnel.is_expiring(now) && tunnel.state() != TunnelState::Expiring {
                tunnel.set_state(TunnelState::Expiring);
            }
        }
    }

    /// Rebuild each expiring tunnel over its own path, once
    fn recreate_expiring(&mut self, direction: Direction, now: u64, builds: &mut Vec<OutgoingBuild>) {
        if now < self.side(direction).backoff_until {
            return;
        }

        let candidates: Vec<(TunnelId, Vec<IdentHash>)> = self
            .side(direction)
            .tunnels
            .values()
            .filter(|t| t.state() == TunnelState::Expiring && !t.recreated && !t.is_zero_hop())
            .map(|t| (t.id(), t.hop_idents()))
            .collect();

        for (id, idents) in candidates {
            if let Some(tunnel) = self.side_mut(direction).tunnels.get_mut(&id) {
                tunnel.recreated = true;
            }
            let path: Option<Vec<SharedRecord>> =
                idents.iter().map(|i| self.selector.store().get(i)).collect();
            let Some(path) = path else {
                debug!("Path of expiring tunnel {} is no longer known", id);
                continue;
            };
            if let Some(build) = self.start_build(direction, &path, Some(id), now) {
                builds.push(build);
            }
        }
    }

    fn fill(&mut self, direction: Direction, now: u64, exclusion: &HashSet<IdentHash>, builds: &mut Vec<OutgoingBuild>) {
        let target = self.config.quantity(direction);
        let live = self.side(direction).live_count(now);
        let pending = self.builder.pending_count(direction);
        let missing = target.saturating_sub(live + pending);
        if missing == 0 || now < self.side(direction).backoff_until {
            return;
        }

        let hops = self.config.hops(direction);
        for _ in 0..missing {
            if hops == 0 {
                let tunnel = Tunnel::zero_hop(direction, self.local, now, self.config.lifetime_ms());
                debug!("Zero-hop {} tunnel {} for {}", direction, tunnel.id(), self.destination);
                self.side_mut(direction).tunnels.insert(tunnel.id(), tunnel);
                continue;
            }

            match self.select_path(direction, hops, exclusion) {
                Ok(path) => {
                    if let Some(build) = self.start_build(direction, &path, None, now) {
                        builds.push(build);
                    }
                }
                Err(e) => {
                    let (initial, max) = self.backoff_bounds();
                    let destination = self.destination;
                    let side = self.side_mut(direction);
                    side.bump_backoff(now, initial, max);
                    warn!(
                        "No {} path for {}: {}; backing off {} ms",
                        direction, destination, e, side.backoff_ms
                    );
                    break;
                }
            }
        }
    }

    fn backoff_bounds(&self) -> (u64, u64) {
        (
            self.config.backoff_initial_secs * 1000,
            self.config.backoff_max_secs * 1000,
        )
    }

    fn select_path(
        &self,
        direction: Direction,
        hops: usize,
        exclusion: &HashSet<IdentHash>,
    ) -> std::result::Result<Vec<SharedRecord>, NetDbError> {
        if self.explicit_peers.len() >= hops {
            return self.selector.select_explicit(hops, &self.explicit_peers);
        }

        // Prefer peers not already carrying our tunnels in this direction
        let mut wider = exclusion.clone();
        wider.extend(
            self.side(direction)
                .tunnels
                .values()
                .flat_map(|t| t.hop_idents()),
        );
        wider.extend(self.builder.pending_peers(direction));

        match self.selector.select(hops, direction, &wider) {
            Ok(path) => Ok(path),
            Err(NetDbError::InsufficientPeers { .. }) if wider.len() > exclusion.len() => {
                self.selector.select(hops, direction, exclusion)
            }
            Err(e) => Err(e),
        }
    }

    fn start_build(
        &mut self,
        direction: Direction,
        path: &[SharedRecord],
        replaces: Option<TunnelId>,
        now: u64,
    ) -> Option<OutgoingBuild> {
        match self.builder.start(direction, path, replaces, now) {
            Ok(build) => {
                self.stats.builds_started += 1;
                Some(build)
            }
            Err(e) => {
                warn!("Failed to encrypt build request: {}", e);
                None
            }
        }
    }

    pub fn is_building(&self, attempt_id: u32) -> bool {
        self.builder.contains(attempt_id)
    }

    pub fn pending_builds(&self) -> usize {
        self.builder.len()
    }

    /// Finish a build with its reply records
    ///
    /// Returns `None` when the attempt is not ours or has already ended.
    pub fn handle_build_reply(&mut self, attempt_id: u32, records: Vec<BuildRecord>, now: u64) -> Option<Result<TunnelId>> {
        let completion = self.builder.handle_reply(attempt_id, records, now)?;
        Some(self.complete(completion, now))
    }

    /// Time out builds and tunnel tests past their deadlines
    pub fn sweep(&mut self, now: u64) -> usize {
        let timed_out = self.builder.sweep(now);
        let count = timed_out.len();
        for completion in timed_out {
            // Already logged by complete()
            let _ = self.complete(completion, now);
        }

        let expired: Vec<u32> = self
            .tests
            .iter()
            .filter(|(_, t)| now >= t.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(test) = self.tests.remove(&id) {
                self.stats.tests_failed += 1;
                self.ack_timeout(Direction::Outbound, test.outbound);
                self.ack_timeout(Direction::Inbound, test.inbound);
            }
        }

        for tunnel in self.inbound.tunnels.values_mut() {
            tunnel.cleanup(now);
        }
        count
    }

    /// End a build whose first hop was unreachable
    pub fn fail_build(&mut self, attempt_id: u32, first_hop: IdentHash, now: u64) -> bool {
        match self.builder.fail_unreachable(attempt_id, first_hop) {
            Some(completion) => {
                let _ = self.complete(completion, now);
                true
            }
            None => false,
        }
    }

    fn complete(&mut self, completion: BuildCompletion, now: u64) -> Result<TunnelId> {
        self.selector.store().record_build_outcomes(&completion.outcomes);
        let direction = completion.direction;

        match completion.result {
            Ok(tunnel) => {
                let id = tunnel.id();
                self.stats.builds_succeeded += 1;
                info!(
                    "Built {} tunnel {} for {} ({} hops)",
                    direction,
                    id,
                    self.destination,
                    tunnel.hops().len()
                );
                let side = self.side_mut(direction);
                side.tunnels.insert(id, tunnel);
                side.consecutive_failures = 0;
                side.degraded = false;
                side.reset_backoff();
                Ok(id)
            }
            Err(e) => {
                match &e {
                    TunnelError::BuildTimeout => self.stats.builds_timed_out += 1,
                    TunnelError::TransportUnreachable(peer) => {
                        self.stats.builds_unreachable += 1;
                        self.failed_peers.push(*peer);
                    }
                    _ => self.stats.builds_rejected += 1,
                }
                self.failed_peers.extend(
                    completion
                        .outcomes
                        .iter()
                        .filter(|(_, o)| *o != BuildOutcome::Agreed)
                        .map(|(i, _)| *i),
                );

                let max_attempts = self.config.max_build_attempts;
                let (initial, max) = self.backoff_bounds();
                let destination = self.destination;
                let side = self.side_mut(direction);
                side.consecutive_failures += 1;
                if side.consecutive_failures >= max_attempts {
                    if !side.degraded {
                        warn!(
                            "{} tunnels for {} degraded after {} failed builds",
                            direction, destination, side.consecutive_failures
                        );
                    }
                    side.degraded = true;
                    side.bump_backoff(now, initial, max);
                } else {
                    debug!("{} build {} for {} failed: {}", direction, completion.attempt_id, destination, e);
                }
                Err(e)
            }
        }
    }

    /// Peers that declined, ignored or could not be reached since the last call
    pub fn take_failed_peers(&mut self) -> Vec<IdentHash> {
        std::mem::take(&mut self.failed_peers)
    }

    pub fn is_degraded(&self) -> bool {
        self.inbound.degraded || self.outbound.degraded
    }

    pub fn is_direction_degraded(&self, direction: Direction) -> bool {
        self.side(direction).degraded
    }

    /// Send a DeliveryStatus through each tested outbound tunnel back through an inbound one
    pub fn start_tests(&mut self, now: u64) -> Vec<TunnelTest> {
        let mut outbound: Vec<TunnelId> = self
            .outbound
            .tunnels
            .values()
            .filter(|t| !t.is_zero_hop() && !t.is_expiring(now))
            .filter(|t| matches!(t.state(), TunnelState::Established | TunnelState::TestFailed))
            .map(|t| t.id())
            .collect();
        let mut inbound: Vec<TunnelId> = self
            .inbound
            .tunnels
            .values()
            .filter(|t| !t.is_zero_hop() && !t.is_expiring(now))
            .filter(|t| matches!(t.state(), TunnelState::Established | TunnelState::TestFailed))
            .map(|t| t.id())
            .collect();
        if inbound.is_empty() {
            return Vec::new();
        }
        outbound.sort_unstable();
        inbound.sort_unstable();

        let deadline = now + self.config.test_timeout_secs * 1000;
        let mut tests = Vec::new();
        for (i, out_id) in outbound.into_iter().enumerate() {
            let in_id = inbound[i % inbound.len()];
            let (Some(out_tunnel), Some(in_tunnel)) =
                (self.outbound.tunnels.get(&out_id), self.inbound.tunnels.get(&in_id))
            else {
                continue;
            };

            let test_id = random_msg_id();
            let (gateway, tunnel_id) = in_tunnel.gateway();
            let status = I2npMessage::delivery_status(test_id);
            match out_tunnel.wrap_outbound(vec![(TunnelDelivery::Tunnel { gateway, tunnel_id }, status)]) {
                Ok(sends) => {
                    self.tests.insert(
                        test_id,
                        PendingTest {
                            outbound: out_id,
                            inbound: in_id,
                            deadline,
                        },
                    );
                    tests.push(TunnelTest {
                        test_id,
                        outbound: out_id,
                        inbound: in_id,
                        sends,
                    });
                }
                Err(e) => debug!("Could not wrap test for tunnel {}: {}", out_id, e),
            }
        }
        tests
    }

    /// Acknowledge a test; returns false for ids this pool did not send
    pub fn handle_delivery_status(&mut self, test_id: u32) -> bool {
        let Some(test) = self.tests.remove(&test_id) else {
            return false;
        };
        self.stats.tests_passed += 1;
        if let Some(t) = self.outbound.tunnels.get_mut(&test.outbound) {
            t.ack_received();
        }
        if let Some(t) = self.inbound.tunnels.get_mut(&test.inbound) {
            t.ack_received();
        }
        true
    }

    pub fn is_testing(&self, test_id: u32) -> bool {
        self.tests.contains_key(&test_id)
    }

    /// Application traffic through `tunnel_id` went undelivered
    pub fn report_delivery_failure(&mut self, tunnel_id: TunnelId) {
        self.ack_timeout(Direction::Outbound, tunnel_id);
    }

    fn ack_timeout(&mut self, direction: Direction, tunnel_id: TunnelId) {
        let threshold = self.config.ack_failure_threshold;
        let destination = self.destination;
        let failed = self
            .side_mut(direction)
            .tunnels
            .get_mut(&tunnel_id)
            .map(|t| t.ack_timeout(threshold))
            .unwrap_or(false);
        if failed {
            self.stats.tunnels_failed += 1;
            info!("{} tunnel {} for {} failed its tests", direction, tunnel_id, destination);
        }
    }

    /// Outbound tunnel for the next message
    pub fn select_outbound(&mut self, now: u64, exclude: Option<TunnelId>) -> Option<&Tunnel> {
        let id = self.outbound.select(now, exclude)?;
        self.outbound.tunnels.get(&id)
    }

    /// Inbound tunnel to name as the reply path
    pub fn select_inbound(&mut self, now: u64) -> Option<&Tunnel> {
        let id = self.inbound.select(now, None)?;
        self.inbound.tunnels.get(&id)
    }

    pub fn tunnel(&self, direction: Direction, tunnel_id: TunnelId) -> Option<&Tunnel> {
        self.side(direction).tunnels.get(&tunnel_id)
    }

    /// Decrypt and reassemble a block arriving on one of our inbound tunnels
    pub fn handle_inbound_data(
        &mut self,
        tunnel_id: TunnelId,
        block: Vec<u8>,
        now: u64,
    ) -> Result<Vec<(TunnelDelivery, I2npMessage)>> {
        self.inbound
            .tunnels
            .get_mut(&tunnel_id)
            .ok_or(TunnelError::UnknownTunnel(tunnel_id))?
            .handle_inbound_block(block, now)
    }

    pub fn inbound_ids(&self) -> Vec<TunnelId> {
        self.inbound.tunnels.keys().copied().collect()
    }

    /// Change hop counts and quantities; existing tunnels run out their lifetime
    pub fn reconfigure(
        &mut self,
        inbound_hops: usize,
        outbound_hops: usize,
        inbound_quantity: usize,
        outbound_quantity: usize,
    ) -> Result<()> {
        let mut config = self.config.clone();
        config.inbound_hops = inbound_hops;
        config.outbound_hops = outbound_hops;
        config.inbound_quantity = inbound_quantity;
        config.outbound_quantity = outbound_quantity;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_explicit_peers(&mut self, peers: Vec<IdentHash>) -> Result<()> {
        check_distinct(&peers)?;
        self.config.explicit_peers = peers.iter().map(|p| p.to_hex()).collect();
        self.explicit_peers = peers;
        Ok(())
    }

    pub fn summaries(&self) -> Vec<TunnelSummary> {
        self.inbound
            .tunnels
            .values()
            .chain(self.outbound.tunnels.values())
            .map(|t| TunnelSummary {
                id: t.id(),
                direction: t.direction(),
                state: t.state().to_string(),
                hops: t.hop_idents(),
                expires: t.expires(),
            })
            .collect()
    }

    /// Live tunnel count in one direction
    pub fn live_count(&self, direction: Direction, now: u64) -> usize {
        self.side(direction).live_count(now)
    }

    /// Cancel every build and drop all tunnels
    pub fn shutdown(&mut self) -> usize {
        let cancelled = self.builder.cancel_all();
        self.inbound.tunnels.clear();
        self.outbound.tunnels.clear();
        self.tests.clear();
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::populated_store;
    use crate::transit::{handle_build_request, TransitTable};
    use veil_crypto::RouterIdentity;
    use veil_protocol::types::now_millis;
    use veil_protocol::{I2npMessageType, ShortTunnelBuild};

    const LOCAL: [u8; 32] = [1u8; 32];

    fn pool(config: PoolConfig, peers: usize) -> (TunnelPool, Vec<RouterIdentity>) {
        let (store, identities) = populated_store(peers);
        let local = IdentHash::from_bytes(LOCAL);
        let selector = PathSelector::new(store, local);
        (
            TunnelPool::new(IdentHash::from_bytes([2u8; 32]), config, selector, local).unwrap(),
            identities,
        )
    }

    fn outbound_only(hops: usize, quantity: usize) -> PoolConfig {
        PoolConfig {
            inbound_quantity: 0,
            outbound_quantity: quantity,
            outbound_hops: hops,
            ..PoolConfig::default()
        }
    }

    /// Run a build through real transit hops and return its reply records
    fn run_build(build: &OutgoingBuild, identities: &[RouterIdentity]) -> Vec<BuildRecord> {
        let mut message = build.message.clone();
        let mut to = build.first_hop;
        loop {
            let identity = identities
                .iter()
                .find(|i| IdentHash::from_bytes(i.ident_hash()) == to)
                .unwrap();
            let mut table = TransitTable::new(10);
            let request = ShortTunnelBuild::from_bytes(&message.payload).unwrap();
            let response = handle_build_request(identity, &mut table, request, now_millis()).unwrap();
            if response.to == IdentHash::from_bytes(LOCAL) {
                assert_eq!(response.message.msg_type, I2npMessageType::ShortTunnelBuild);
                return ShortTunnelBuild::from_bytes(&response.message.payload).unwrap().records;
            }
            to = response.to;
            message = response.message;
        }
    }

    fn inbound_only(hops: usize, quantity: usize) -> PoolConfig {
        PoolConfig {
            inbound_quantity: quantity,
            inbound_hops: hops,
            outbound_quantity: 0,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (mut pool, _) = pool(outbound_only(3, 2), 10);
        let builds = pool.reconcile(0, &HashSet::new());
        assert_eq!(builds.len(), 2);
        assert!(pool.reconcile(0, &HashSet::new()).is_empty());
        assert!(pool.reconcile(1000, &HashSet::new()).is_empty());
        assert_eq!(pool.pending_builds(), 2);
    }

    #[test]
    fn test_converges_to_target_with_distinct_hops() {
        let (mut pool, identities) = pool(inbound_only(3, 2), 10);
        let now = now_millis();
        for build in pool.reconcile(now, &HashSet::new()) {
            let records = run_build(&build, &identities);
            pool.handle_build_reply(build.attempt_id, records, now).unwrap().unwrap();
        }

        assert_eq!(pool.live_count(Direction::Inbound, now), 2);
        for summary in pool.summaries() {
            let distinct: HashSet<_> = summary.hops.iter().collect();
            assert_eq!(distinct.len(), 3);
        }
        assert!(pool.reconcile(now, &HashSet::new()).is_empty());
        assert_eq!(pool.stats().builds_succeeded, 2);
    }

    #[test]
    fn test_insufficient_peers_backs_off() {
        let (mut pool, _) = pool(outbound_only(3, 1), 2);
        assert!(pool.reconcile(0, &HashSet::new()).is_empty());
        assert_eq!(pool.outbound.backoff_ms, 5000);
        assert!(pool.reconcile(4999, &HashSet::new()).is_empty());
        assert!(pool.reconcile(5000, &HashSet::new()).is_empty());
        assert_eq!(pool.outbound.backoff_ms, 10_000);
        assert_eq!(pool.outbound.backoff_until, 15_000);
    }

    #[test]
    fn test_timeouts_degrade_after_max_attempts() {
        let config = PoolConfig {
            max_build_attempts: 2,
            ..outbound_only(2, 1)
        };
        let (mut pool, _) = pool(config, 10);

        let mut now = 0;
        for _ in 0..2 {
            assert_eq!(pool.reconcile(now, &HashSet::new()).len(), 1);
            now += 30_000;
            assert_eq!(pool.sweep(now), 1);
        }
        assert!(pool.is_degraded());
        assert!(pool.is_direction_degraded(Direction::Outbound));
        assert_eq!(pool.stats().builds_timed_out, 2);
        assert_eq!(pool.take_failed_peers().len(), 4);
        // backing off after degradation
        assert!(pool.reconcile(now, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_zero_hop_tunnels_are_immediate() {
        let (mut pool, _) = pool(outbound_only(0, 2), 0);
        assert!(pool.reconcile(0, &HashSet::new()).is_empty());
        assert_eq!(pool.live_count(Direction::Outbound, 0), 2);
        let tunnel = pool.select_outbound(0, None).unwrap();
        assert!(tunnel.is_zero_hop());
    }

    #[test]
    fn test_selection_is_least_recently_used() {
        let (mut pool, _) = pool(outbound_only(0, 2), 0);
        pool.reconcile(0, &HashSet::new());
        let first = pool.select_outbound(10, None).unwrap().id();
        let second = pool.select_outbound(20, None).unwrap().id();
        assert_ne!(first, second);
        assert_eq!(pool.select_outbound(30, None).unwrap().id(), first);
        assert_eq!(pool.select_outbound(40, Some(second)).unwrap().id(), first);
    }

    #[test]
    fn test_expiring_tunnels_are_replaced_once() {
        let config = PoolConfig {
            lifetime_secs: 200,
            ..inbound_only(2, 1)
        };
        let (mut pool, identities) = pool(config, 10);
        let now = now_millis();
        let build = pool.reconcile(now, &HashSet::new()).pop().unwrap();
        let records = run_build(&build, &identities);
        let id = pool.handle_build_reply(build.attempt_id, records, now).unwrap().unwrap();
        let path = pool.tunnel(Direction::Inbound, id).unwrap().hop_idents();

        let later = now + 120_000;
        let replacements = pool.reconcile(later, &HashSet::new());
        assert_eq!(replacements.len(), 1);
        assert_eq!(replacements[0].first_hop, path[0]);
        assert_eq!(pool.tunnel(Direction::Inbound, id).unwrap().state(), TunnelState::Expiring);
        assert!(pool.select_inbound(later).is_none());
        assert!(pool.reconcile(later, &HashSet::new()).is_empty());

        // expired and gone
        pool.reconcile(now + 200_000, &HashSet::new());
        assert!(pool.tunnel(Direction::Inbound, id).is_none());
    }

    #[test]
    fn test_failed_tests_fail_tunnels() {
        let config = PoolConfig {
            inbound_hops: 2,
            outbound_hops: 2,
            inbound_quantity: 1,
            outbound_quantity: 1,
            ..PoolConfig::default()
        };
        let (mut pool, identities) = pool(config, 10);
        let now = now_millis();
        let mut builds = pool.reconcile(now, &HashSet::new());
        // outbound replies arrive garlic-wrapped; complete only the inbound one here
        builds.retain(|b| b.direction == Direction::Inbound);
        for build in builds {
            let records = run_build(&build, &identities);
            pool.handle_build_reply(build.attempt_id, records, now).unwrap().unwrap();
        }
        let outbound = Tunnel::zero_hop(Direction::Outbound, IdentHash::from_bytes(LOCAL), now, 600_000);
        let outbound_id = outbound.id();
        pool.outbound.tunnels.insert(outbound_id, outbound);

        // zero-hop tunnels are not tested
        assert!(pool.start_tests(now).is_empty());
        pool.report_delivery_failure(outbound_id);
        assert_eq!(pool.tunnel(Direction::Outbound, outbound_id).unwrap().state(), TunnelState::TestFailed);
        pool.report_delivery_failure(outbound_id);
        assert_eq!(pool.tunnel(Direction::Outbound, outbound_id).unwrap().state(), TunnelState::Failed);
        assert_eq!(pool.stats().tunnels_failed, 1);
    }

    #[test]
    fn test_delivery_status_restores_tunnel() {
        let config = PoolConfig {
            inbound_hops: 1,
            outbound_hops: 1,
            inbound_quantity: 1,
            outbound_quantity: 0,
            ..PoolConfig::default()
        };
        let (mut pool, identities) = pool(config, 10);
        let now = now_millis();
        let build = pool.reconcile(now, &HashSet::new()).pop().unwrap();
        let records = run_build(&build, &identities);
        let inbound_id = pool.handle_build_reply(build.attempt_id, records, now).unwrap().unwrap();

        let outbound = Tunnel::zero_hop(Direction::Outbound, IdentHash::from_bytes(LOCAL), now, 600_000);
        let outbound_id = outbound.id();
        pool.outbound.tunnels.insert(outbound_id, outbound);
        pool.tests.insert(
            77,
            PendingTest {
                outbound: outbound_id,
                inbound: inbound_id,
                deadline: now + 10_000,
            },
        );
        pool.report_delivery_failure(outbound_id);
        assert!(pool.handle_delivery_status(77));
        assert!(!pool.handle_delivery_status(77));
        assert!(pool.tunnel(Direction::Outbound, outbound_id).unwrap().is_established());

        pool.tests.insert(
            78,
            PendingTest {
                outbound: outbound_id,
                inbound: inbound_id,
                deadline: now + 10_000,
            },
        );
        pool.sweep(now + 10_000);
        assert_eq!(pool.stats().tests_failed, 1);
        assert_eq!(pool.tunnel(Direction::Inbound, inbound_id).unwrap().state(), TunnelState::TestFailed);
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        let too_many_hops = PoolConfig {
            inbound_hops: 8,
            ..PoolConfig::default()
        };
        assert!(too_many_hops.validate().is_err());
        let slow_builds = PoolConfig {
            build_timeout_secs: 600,
            ..PoolConfig::default()
        };
        assert!(slow_builds.validate().is_err());
        let bad_peer = PoolConfig {
            explicit_peers: vec!["zz".to_string()],
            ..PoolConfig::default()
        };
        assert!(bad_peer.validate().is_err());
    }

    #[test]
    fn test_reconfigure_and_explicit_peers() {
        let (mut pool, identities) = pool(outbound_only(3, 1), 10);
        assert!(pool.reconfigure(2, 2, 0, 1).is_ok());
        assert!(pool.reconfigure(9, 2, 0, 1).is_err());
        assert_eq!(pool.config().outbound_hops, 2);

        let explicit: Vec<IdentHash> = identities[..2]
            .iter()
            .map(|i| IdentHash::from_bytes(i.ident_hash()))
            .collect();
        pool.set_explicit_peers(explicit.clone()).unwrap();
        let build = pool.reconcile(0, &HashSet::new()).pop().unwrap();
        assert_eq!(build.first_hop, explicit[0]);
    }

    #[test]
    fn test_duplicate_explicit_peers_rejected() {
        let (mut pool, identities) = pool(outbound_only(2, 1), 10);
        let a = IdentHash::from_bytes(identities[0].ident_hash());
        let b = IdentHash::from_bytes(identities[1].ident_hash());

        assert!(matches!(
            pool.set_explicit_peers(vec![a, a, b]),
            Err(TunnelError::InvalidConfig(_))
        ));
        assert!(pool.config().explicit_peers.is_empty());

        let config = PoolConfig {
            explicit_peers: vec![a.to_hex(), b.to_hex(), a.to_hex()],
            ..outbound_only(2, 1)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unreachable_first_hop_is_not_a_timeout() {
        let (mut pool, _) = pool(outbound_only(2, 1), 10);
        let build = pool.reconcile(0, &HashSet::new()).pop().unwrap();

        assert!(pool.fail_build(build.attempt_id, build.first_hop, 0));
        assert!(!pool.fail_build(build.attempt_id, build.first_hop, 0));
        assert_eq!(pool.stats().builds_unreachable, 1);
        assert_eq!(pool.stats().builds_timed_out, 0);
        assert_eq!(pool.take_failed_peers(), vec![build.first_hop]);
        assert_eq!(pool.pending_builds(), 0);
    }
}
