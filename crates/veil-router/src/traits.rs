//! Collaborators the router is wired to

use async_trait::async_trait;
use veil_protocol::IdentHash;

use crate::error::Result;

pub use veil_netdb::NetDb;

/// Sends bytes to a peer over an encrypted link
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fails with `TransportUnreachable` when no link to `peer` can be made
    async fn send_encrypted(&self, peer: &IdentHash, bytes: Vec<u8>) -> Result<()>;
}

/// Receives payloads addressed to local destinations
#[async_trait]
pub trait Application: Send + Sync {
    async fn deliver_local(&self, destination: IdentHash, payload: Vec<u8>);
}
