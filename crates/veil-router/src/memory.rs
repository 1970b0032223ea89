//! In-process network for simulations and tests
//!
//! Each attached router gets an unbounded inbox drained by its own task.
//! Links can be cut per router to simulate unreachable peers.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;
use veil_protocol::IdentHash;

use crate::error::{Result, RouterError};
use crate::router::Router;
use crate::traits::{Application, Transport};

type Inbox = mpsc::UnboundedSender<(IdentHash, Vec<u8>)>;

#[derive(Default)]
pub struct MemoryNetwork {
    inboxes: DashMap<IdentHash, Inbox>,
    unreachable: DashSet<IdentHash>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport that sends on behalf of `local`
    pub fn transport_for(self: &Arc<Self>, local: IdentHash) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            local,
            network: Arc::clone(self),
        })
    }

    /// Start delivering messages addressed to `router`
    pub fn attach(&self, router: Arc<Router>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(IdentHash, Vec<u8>)>();
        self.inboxes.insert(router.local_ident(), tx);

        tokio::spawn(async move {
            while let Some((from, bytes)) = rx.recv().await {
                router.on_receive(from, &bytes).await;
            }
        })
    }

    /// Remove a router; its receive task ends once the inbox drains
    pub fn detach(&self, ident: &IdentHash) -> bool {
        self.inboxes.remove(ident).is_some()
    }

    /// Make sends to `ident` fail, or succeed again
    pub fn set_reachable(&self, ident: IdentHash, reachable: bool) {
        if reachable {
            self.unreachable.remove(&ident);
        } else {
            self.unreachable.insert(ident);
        }
    }

    pub fn len(&self) -> usize {
        self.inboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }

    fn deliver(&self, from: IdentHash, to: &IdentHash, bytes: Vec<u8>) -> Result<()> {
        if self.unreachable.contains(to) {
            return Err(RouterError::TransportUnreachable(*to));
        }
        let inbox = self
            .inboxes
            .get(to)
            .map(|i| i.value().clone())
            .ok_or(RouterError::TransportUnreachable(*to))?;
        trace!("{} -> {}: {} bytes", from, to, bytes.len());
        inbox
            .send((from, bytes))
            .map_err(|_| RouterError::TransportUnreachable(*to))
    }
}

pub struct MemoryTransport {
    local: IdentHash,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_encrypted(&self, peer: &IdentHash, bytes: Vec<u8>) -> Result<()> {
        self.network.deliver(self.local, peer, bytes)
    }
}

/// Application that forwards every delivered payload to a channel
pub struct ChannelApplication {
    tx: mpsc::UnboundedSender<(IdentHash, Vec<u8>)>,
}

impl ChannelApplication {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(IdentHash, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelApplication { tx }), rx)
    }
}

#[async_trait]
impl Application for ChannelApplication {
    async fn deliver_local(&self, destination: IdentHash, payload: Vec<u8>) {
        let _ = self.tx.send((destination, payload));
    }
}
