//! Veil network database
//!
//! Verified peer records, per-peer profiles, and tunnel path selection.
//! Records come from an external network database behind the [`NetDb`]
//! trait; the local [`PeerStore`] keeps a copy-on-write snapshot that path
//! selection reads without locking out writers.

pub mod error;
pub mod netdb;
pub mod profile;
pub mod record;
pub mod selector;
pub mod store;

pub use error::{NetDbError, Result};
pub use netdb::{MemoryNetDb, NetDb, SampleConstraints};
pub use profile::{BuildOutcome, PeerProfile, SelectionCounts};
pub use record::{NetworkPrefix, PeerCaps, PeerRecord, SharedRecord};
pub use selector::{PathSelector, MAX_TUNNEL_HOPS};
pub use store::{PeerStore, StoreSnapshot};
