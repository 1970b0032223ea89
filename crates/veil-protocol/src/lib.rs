//! Veil Protocol Module
//!
//! Wire formats owned by the tunnel and garlic core. Layouts are bit-exact
//! with other routers speaking the same protocol:
//! - I2NP message header and the control messages built on it
//! - Short tunnel build request/response records
//! - Tunnel data messages and fragment delivery instructions

pub mod build;
pub mod delivery;
pub mod error;
pub mod i2np;
pub mod tunnel_data;
pub mod types;

pub use build::{BuildRequestRecord, HopFlags, ShortTunnelBuild};
pub use delivery::{FragmentHeader, TunnelDelivery};
pub use error::{ProtocolError, Result};
pub use i2np::{I2npMessage, I2npMessageType};
pub use tunnel_data::TunnelDataMessage;
pub use types::{Direction, IdentHash, TunnelId};
