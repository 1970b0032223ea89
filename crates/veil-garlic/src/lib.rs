//! Veil garlic routing
//!
//! Bundles I2NP messages into cloves, encrypts them for a router or a
//! destination, and dispatches unwrapped cloves by delivery instruction.
//! New sessions open with one-shot Noise `N` messages that ask for an
//! acknowledgment; once one is acknowledged, later messages to the same
//! destination use ratchet tags.

pub mod block;
pub mod clove;
pub mod error;
pub mod processor;
pub mod session;
pub mod tagset;

pub use clove::{Clove, CloveDelivery};
pub use error::{GarlicError, Result};
pub use processor::{wrap_one_time, CloveHandler, GarlicConfig, GarlicProcessor, Recipient};
pub use session::MAX_PENDING_HANDSHAKES;
pub use tagset::{SessionTag, TagSet, SESSION_TAG_SIZE};
