//! In-process network of routers
//!
//! Every router knows every other one and talks over a shared
//! [`MemoryNetwork`]. Used to exercise tunnel building and garlic delivery
//! end to end without real links.

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::OsRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use veil_crypto::{RouterIdentity, X25519StaticSecret};
use veil_netdb::{MemoryNetDb, PeerCaps, PeerRecord, PeerStore};
use veil_protocol::{Direction, IdentHash};
use veil_router::{ChannelApplication, MemoryNetwork, Router, RouterConfig, RouterStats};

pub struct Simulation {
    network: Arc<MemoryNetwork>,
    routers: Vec<Arc<Router>>,
    inboxes: Vec<UnboundedReceiver<(IdentHash, Vec<u8>)>>,
    receive_tasks: Vec<JoinHandle<()>>,
}

/// Outcome of a run, printed as YAML
#[derive(Debug, Serialize)]
pub struct Report {
    pub routers: usize,
    pub messages_sent: usize,
    pub messages_delivered: usize,
    pub sender: RouterStats,
    pub receiver: RouterStats,
    pub transit_tunnels: usize,
}

impl Simulation {
    pub fn new(peers: usize, config: &RouterConfig) -> Result<Self> {
        if peers < 2 {
            bail!("A simulation needs at least 2 routers, got {}", peers);
        }
        if peers > 250 {
            bail!("At most 250 routers are supported, got {}", peers);
        }
        veil_crypto::init().context("Failed to initialize crypto")?;

        let identities: Vec<RouterIdentity> = (0..peers).map(|_| RouterIdentity::generate()).collect();
        let records = identities
            .iter()
            .enumerate()
            .map(|(i, identity)| {
                let address = format!("10.{}.0.1:4000", i)
                    .parse()
                    .context("Invalid simulated address")?;
                Ok(PeerRecord::new_signed(identity, vec![address], PeerCaps::REACHABLE))
            })
            .collect::<Result<Vec<_>>>()?;

        let network = MemoryNetwork::new();
        let mut routers = Vec::with_capacity(peers);
        let mut inboxes = Vec::with_capacity(peers);
        let mut receive_tasks = Vec::with_capacity(peers);

        for identity in identities {
            let netdb = Arc::new(MemoryNetDb::new());
            let store = Arc::new(PeerStore::new());
            for record in &records {
                store.insert(record.clone())?;
            }

            let local = IdentHash::from_bytes(identity.ident_hash());
            let (application, inbox) = ChannelApplication::new();
            let router = Router::new(
                identity,
                config.clone(),
                store,
                netdb,
                network.transport_for(local),
                application,
            )?;
            receive_tasks.push(network.attach(Arc::clone(&router)));
            routers.push(router);
            inboxes.push(inbox);
        }

        info!("Simulated network of {} routers ready", peers);
        Ok(Simulation {
            network,
            routers,
            inboxes,
            receive_tasks,
        })
    }

    pub fn router(&self, index: usize) -> Result<&Arc<Router>> {
        self.routers
            .get(index)
            .ok_or_else(|| anyhow!("No router {}", index))
    }

    pub async fn start(&self) {
        for router in &self.routers {
            router.start().await;
        }
    }

    /// Host a new destination on router `index`
    pub fn add_destination(&self, index: usize) -> Result<IdentHash> {
        let destination = self
            .router(index)?
            .add_destination(X25519StaticSecret::random_from_rng(OsRng))?;
        Ok(destination)
    }

    /// Wait until `destination` has its full set of tunnels
    pub async fn wait_ready(&self, index: usize, destination: &IdentHash, timeout: Duration) -> Result<()> {
        let router = self.router(index)?;
        let config = &router.config().tunnels;
        let (inbound, outbound) = (config.inbound_quantity, config.outbound_quantity);

        let ready = async {
            loop {
                if router.live_tunnels(destination, Direction::Inbound).await >= inbound
                    && router.live_tunnels(destination, Direction::Outbound).await >= outbound
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, ready)
            .await
            .map_err(|_| anyhow!("Tunnels for {} not ready after {:?}", destination, timeout))?;
        debug!("Destination {} ready", destination);
        Ok(())
    }

    /// Send `count` payloads from one destination to another and count arrivals
    pub async fn exchange(
        &mut self,
        (from_index, from): (usize, IdentHash),
        (to_index, to): (usize, IdentHash),
        count: usize,
        timeout: Duration,
    ) -> Result<Report> {
        let receiver = Arc::clone(self.router(to_index)?);
        let sender = Arc::clone(self.router(from_index)?);
        let lease_set = receiver
            .lease_set(&to)
            .await
            .ok_or_else(|| anyhow!("Destination {} is not hosted", to))?;
        sender.learn_lease_set(lease_set);

        for i in 0..count {
            let payload = format!("message {}", i).into_bytes();
            sender.submit_outbound(&from, &to, payload).await?;
        }

        let inbox = self
            .inboxes
            .get_mut(to_index)
            .ok_or_else(|| anyhow!("No router {}", to_index))?;
        let mut delivered = 0;
        let deadline = tokio::time::Instant::now() + timeout;
        while delivered < count {
            match tokio::time::timeout_at(deadline, inbox.recv()).await {
                Ok(Some((destination, _))) if destination == to => delivered += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        let mut transit_tunnels = 0;
        for router in &self.routers {
            transit_tunnels += router.transit_count().await;
        }

        Ok(Report {
            routers: self.routers.len(),
            messages_sent: count,
            messages_delivered: delivered,
            sender: sender.stats().await,
            receiver: receiver.stats().await,
            transit_tunnels,
        })
    }

    pub async fn shutdown(self) {
        for router in &self.routers {
            router.shutdown().await;
            self.network.detach(&router.local_ident());
        }
        for task in self.receive_tasks {
            task.abort();
        }
        info!("Simulation stopped");
    }
}
