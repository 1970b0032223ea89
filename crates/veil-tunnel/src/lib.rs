//! Veil tunnels
//!
//! Builds and maintains multi-hop tunnels:
//! - build record encryption and reply decryption ([`config`])
//! - per-attempt build arena with deadlines ([`builder`])
//! - per-destination pools with reconciliation and testing ([`pool`])
//! - gateway fragmentation and endpoint reassembly
//! - transit participation in other routers' tunnels

pub mod builder;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod transit;
pub mod tunnel;

#[cfg(test)]
mod test_util;

pub use builder::{BuildCompletion, BuildState, OutgoingBuild, TunnelBuilder};
pub use config::{create_build_request, decrypt_build_reply, BuildSecrets};
pub use endpoint::TunnelEndpoint;
pub use error::{Result, TunnelError};
pub use gateway::fragment_messages;
pub use pool::{PoolConfig, PoolStats, TunnelPool, TunnelSummary, TunnelTest};
pub use transit::{
    handle_build_request, BuildResponse, TransitAction, TransitRole, TransitTable,
    DEFAULT_MAX_TRANSIT_TUNNELS,
};
pub use tunnel::{Tunnel, TunnelSend, TunnelState};
