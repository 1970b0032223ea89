//! Router error types

use thiserror::Error;
use veil_protocol::IdentHash;

/// Router-level errors
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Peer unreachable: {0}")]
    TransportUnreachable(IdentHash),

    #[error("Outbound queue full for {0}")]
    QueueFull(IdentHash),

    #[error("Tunnels for {0} are degraded")]
    Degraded(IdentHash),

    #[error("Unknown local destination: {0}")]
    UnknownDestination(IdentHash),

    #[error("No lease set for {0}")]
    NoLeaseSet(IdentHash),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] veil_tunnel::TunnelError),

    #[error("Garlic error: {0}")]
    Garlic(#[from] veil_garlic::GarlicError),

    #[error("NetDb error: {0}")]
    NetDb(#[from] veil_netdb::NetDbError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] veil_protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),
}

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;
