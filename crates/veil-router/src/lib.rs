//! Veil router core
//!
//! Hosts local destinations on top of the tunnel and garlic layers:
//! - One tunnel pool and outbound queue per destination
//! - Transit participation in other routers' tunnels
//! - A single work loop dispatching every received message
//! - Background management of builds, tests and housekeeping

pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod memory;
pub mod router;
pub mod shard;
pub mod traits;

pub use config::{RouterConfig, TransitConfig};
pub use error::{Result, RouterError};
pub use lease::{destination_hash, Lease, LeaseSet, LocalDestination};
pub use memory::{ChannelApplication, MemoryNetwork, MemoryTransport};
pub use router::{Router, RouterStats};
pub use shard::{DestinationShard, QueuedMessage};
pub use traits::{Application, NetDb, Transport};
