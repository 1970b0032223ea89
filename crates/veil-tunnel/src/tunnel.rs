//! Built tunnels
//!
//! A tunnel owns its hops' layer ciphers. Outbound tunnels pre-decrypt
//! every block with each hop's layer in reverse order so the hops' own
//! transforms leave cleartext at the endpoint. Inbound tunnels undo the
//! hops' transforms the same way on arrival.

use std::fmt;
use veil_crypto::LayerCipher;
use veil_protocol::types::random_tunnel_id;
use veil_protocol::{
    Direction, I2npMessage, I2npMessageType, IdentHash, TunnelDataMessage, TunnelDelivery, TunnelId,
};

use crate::config::BuildSecrets;
use crate::endpoint::TunnelEndpoint;
use crate::error::Result;
use crate::gateway::fragment_messages;

/// Tunnel lifetime once built (ms)
pub const TUNNEL_EXPIRATION_TIMEOUT_MS: u64 = 660_000;

/// Time before expiry at which a tunnel stops being selected and is rebuilt (ms)
pub const TUNNEL_RECREATION_THRESHOLD_MS: u64 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Build in flight
    Pending,
    Established,
    /// Missed at least one acknowledgment but still under the threshold
    TestFailed,
    Failed,
    /// Close to expiry; kept for in-flight traffic only
    Expiring,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Pending => "pending",
            TunnelState::Established => "established",
            TunnelState::TestFailed => "test-failed",
            TunnelState::Failed => "failed",
            TunnelState::Expiring => "expiring",
        };
        f.write_str(s)
    }
}

/// One remote hop
#[derive(Clone)]
pub struct TunnelHop {
    pub ident: IdentHash,
    /// Tunnel id this hop receives on
    pub tunnel_id: TunnelId,
    layer: LayerCipher,
}

impl fmt::Debug for TunnelHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHop")
            .field("ident", &self.ident)
            .field("tunnel_id", &self.tunnel_id)
            .finish_non_exhaustive()
    }
}

/// What to do with one piece of outbound traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSend {
    /// Send to the first hop
    Hop { to: IdentHash, message: I2npMessage },
    /// Zero-hop tunnel: we are the endpoint
    Local {
        delivery: TunnelDelivery,
        message: I2npMessage,
    },
}

#[derive(Debug)]
pub struct Tunnel {
    id: TunnelId,
    direction: Direction,
    hops: Vec<TunnelHop>,
    local: IdentHash,
    created: u64,
    expires: u64,
    state: TunnelState,
    pub(crate) last_used: u64,
    pub(crate) test_failures: u32,
    pub(crate) recreated: bool,
    endpoint: TunnelEndpoint,
}

impl Tunnel {
    /// Tunnel from a confirmed build
    pub fn from_build(secrets: &BuildSecrets, local: IdentHash, now: u64, lifetime: u64) -> Self {
        let hops: Vec<TunnelHop> = secrets
            .hops
            .iter()
            .map(|h| TunnelHop {
                ident: h.ident,
                tunnel_id: h.receive_tunnel,
                layer: LayerCipher::new(h.layer_keys()),
            })
            .collect();

        let id = match secrets.direction {
            Direction::Inbound => secrets.local_receive_tunnel.unwrap_or_else(random_tunnel_id),
            Direction::Outbound => hops.first().map(|h| h.tunnel_id).unwrap_or_else(random_tunnel_id),
        };

        Self::with_hops(id, secrets.direction, hops, local, now, lifetime)
    }

    /// Tunnel through the local router only
    pub fn zero_hop(direction: Direction, local: IdentHash, now: u64, lifetime: u64) -> Self {
        Self::with_hops(random_tunnel_id(), direction, Vec::new(), local, now, lifetime)
    }

    fn with_hops(
        id: TunnelId,
        direction: Direction,
        hops: Vec<TunnelHop>,
        local: IdentHash,
        now: u64,
        lifetime: u64,
    ) -> Self {
        Tunnel {
            id,
            direction,
            hops,
            local,
            created: now,
            expires: now + lifetime,
            state: TunnelState::Established,
            last_used: 0,
            test_failures: 0,
            recreated: false,
            endpoint: TunnelEndpoint::new(),
        }
    }

    /// Outbound: id at the first hop. Inbound: our receive id.
    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn hops(&self) -> &[TunnelHop] {
        &self.hops
    }

    pub fn hop_idents(&self) -> Vec<IdentHash> {
        self.hops.iter().map(|h| h.ident).collect()
    }

    pub fn is_zero_hop(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TunnelState) {
        self.state = state;
    }

    pub fn is_established(&self) -> bool {
        self.state == TunnelState::Established
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn expires(&self) -> u64 {
        self.expires
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires
    }

    pub fn is_expiring(&self, now: u64) -> bool {
        self.expires.saturating_sub(now) <= TUNNEL_RECREATION_THRESHOLD_MS
    }

    /// Router and tunnel id where traffic enters this tunnel
    pub fn gateway(&self) -> (IdentHash, TunnelId) {
        match self.hops.first() {
            Some(hop) => (hop.ident, hop.tunnel_id),
            None => (self.local, self.id),
        }
    }

    /// Fragment and layer messages for sending through this outbound tunnel
    pub fn wrap_outbound(&self, messages: Vec<(TunnelDelivery, I2npMessage)>) -> Result<Vec<TunnelSend>> {
        let Some(first) = self.hops.first() else {
            return Ok(messages
                .into_iter()
                .map(|(delivery, message)| TunnelSend::Local { delivery, message })
                .collect());
        };

        let blocks = fragment_messages(&messages)?;
        let mut sends = Vec::with_capacity(blocks.len());
        for mut block in blocks {
            for hop in self.hops.iter().rev() {
                hop.layer.decrypt(&mut block)?;
            }
            let data = TunnelDataMessage::new(first.tunnel_id, block)?;
            sends.push(TunnelSend::Hop {
                to: first.ident,
                message: I2npMessage::new(I2npMessageType::TunnelData, data.to_bytes()),
            });
        }
        Ok(sends)
    }

    /// Undo the hops' layers on an inbound block and reassemble
    pub fn handle_inbound_block(
        &mut self,
        mut block: Vec<u8>,
        now: u64,
    ) -> Result<Vec<(TunnelDelivery, I2npMessage)>> {
        for hop in self.hops.iter().rev() {
            hop.layer.decrypt(&mut block)?;
        }
        self.endpoint.handle_block(&block, now)
    }

    /// Drop stale partial messages
    pub fn cleanup(&mut self, now: u64) -> usize {
        self.endpoint.cleanup(now)
    }

    /// Count a missed acknowledgment; returns true once the tunnel has failed
    pub(crate) fn ack_timeout(&mut self, threshold: u32) -> bool {
        self.test_failures += 1;
        if self.test_failures >= threshold {
            self.state = TunnelState::Failed;
            true
        } else {
            if self.state == TunnelState::Established {
                self.state = TunnelState::TestFailed;
            }
            false
        }
    }

    pub(crate) fn ack_received(&mut self) {
        self.test_failures = 0;
        if self.state == TunnelState::TestFailed {
            self.state = TunnelState::Established;
        }
    }
}
