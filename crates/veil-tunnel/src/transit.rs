//! Transit participation
//!
//! Handles build requests addressed to us and the traffic of tunnels we
//! agreed to join as gateway, participant or endpoint.

use std::collections::HashMap;
use tracing::{debug, trace};
use veil_crypto::aead::{self, nonce_from_counter};
use veil_crypto::{open_n, LayerCipher, LayerKeys, RouterIdentity};
use veil_garlic::{wrap_one_time, Clove, CloveDelivery};
use veil_protocol::build::{
    response_cleartext, return_code, BuildRequestRecord, SHORT_REQUEST_RECORD_ENCRYPTED_OFFSET,
};
use veil_protocol::{
    I2npMessage, I2npMessageType, IdentHash, ShortTunnelBuild, TunnelDataMessage, TunnelDelivery,
    TunnelId,
};

use crate::config::{derive_hop_keys, mask_record};
use crate::endpoint::TunnelEndpoint;
use crate::error::{Result, TunnelError};
use crate::gateway::fragment_messages;
use crate::tunnel::TUNNEL_EXPIRATION_TIMEOUT_MS;

/// Default cap on transit tunnels
pub const DEFAULT_MAX_TRANSIT_TUNNELS: usize = 2500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitRole {
    /// Inbound gateway: receives TunnelGateway messages
    Gateway,
    Participant,
    /// Outbound endpoint: reassembles and delivers
    Endpoint,
}

pub struct TransitTunnel {
    pub receive_tunnel: TunnelId,
    pub next_tunnel: TunnelId,
    pub next_ident: IdentHash,
    pub role: TransitRole,
    pub created: u64,
    layer: LayerCipher,
    endpoint: Option<TunnelEndpoint>,
}

impl std::fmt::Debug for TransitTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitTunnel")
            .field("receive_tunnel", &self.receive_tunnel)
            .field("next_tunnel", &self.next_tunnel)
            .field("next_ident", &self.next_ident)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl TransitTunnel {
    fn forward(&self, block: Vec<u8>) -> Result<TransitAction> {
        let data = TunnelDataMessage::new(self.next_tunnel, block)?;
        Ok(TransitAction::Forward {
            to: self.next_ident,
            message: I2npMessage::new(I2npMessageType::TunnelData, data.to_bytes()),
        })
    }
}

/// Result of processing transit traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitAction {
    Forward { to: IdentHash, message: I2npMessage },
    /// Outbound endpoint delivery of a reassembled message
    Deliver {
        delivery: TunnelDelivery,
        message: I2npMessage,
    },
}

/// Transit tunnels keyed by receive tunnel id
#[derive(Debug)]
pub struct TransitTable {
    tunnels: HashMap<TunnelId, TransitTunnel>,
    max_tunnels: usize,
}

impl TransitTable {
    pub fn new(max_tunnels: usize) -> Self {
        TransitTable {
            tunnels: HashMap::new(),
            max_tunnels,
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tunnels.len() >= self.max_tunnels
    }

    pub fn contains(&self, tunnel_id: TunnelId) -> bool {
        self.tunnels.contains_key(&tunnel_id)
    }

    pub fn get(&self, tunnel_id: TunnelId) -> Option<&TransitTunnel> {
        self.tunnels.get(&tunnel_id)
    }

    pub fn set_max_tunnels(&mut self, max_tunnels: usize) {
        self.max_tunnels = max_tunnels;
    }

    /// Apply our layer to a TunnelData message
    pub fn handle_tunnel_data(&mut self, data: &TunnelDataMessage, now: u64) -> Result<Vec<TransitAction>> {
        let tunnel = self
            .tunnels
            .get_mut(&data.tunnel_id)
            .ok_or(TunnelError::UnknownTunnel(data.tunnel_id))?;

        let mut block = data.block.clone();
        tunnel.layer.encrypt(&mut block)?;

        match tunnel.endpoint.as_mut() {
            Some(endpoint) => Ok(endpoint
                .handle_block(&block, now)?
                .into_iter()
                .map(|(delivery, message)| TransitAction::Deliver { delivery, message })
                .collect()),
            None => Ok(vec![tunnel.forward(block)?]),
        }
    }

    /// Inject a message at an inbound gateway
    pub fn handle_tunnel_gateway(&mut self, tunnel_id: TunnelId, message: I2npMessage) -> Result<Vec<TransitAction>> {
        let tunnel = self
            .tunnels
            .get(&tunnel_id)
            .filter(|t| t.role == TransitRole::Gateway)
            .ok_or(TunnelError::UnknownTunnel(tunnel_id))?;

        let mut actions = Vec::new();
        for mut block in fragment_messages(&[(TunnelDelivery::Local, message)])? {
            tunnel.layer.encrypt(&mut block)?;
            actions.push(tunnel.forward(block)?);
        }
        Ok(actions)
    }

    /// Drop tunnels past their lifetime and stale endpoint fragments
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.tunnels.len();
        self.tunnels
            .retain(|_, t| now < t.created + TUNNEL_EXPIRATION_TIMEOUT_MS);
        for tunnel in self.tunnels.values_mut() {
            if let Some(endpoint) = tunnel.endpoint.as_mut() {
                endpoint.cleanup(now);
            }
        }
        before - self.tunnels.len()
    }

    pub fn clear(&mut self) {
        self.tunnels.clear();
    }
}

/// Our answer to a build request and where it goes next
#[derive(Debug)]
pub struct BuildResponse {
    pub accepted: bool,
    pub to: IdentHash,
    pub message: I2npMessage,
}

/// Process the build record addressed to `identity`
///
/// The record is answered in place, every other record is masked with our
/// reply key, and the build moves on to the next hop. The outbound endpoint
/// instead sends the finished reply to the creator inside a one-time garlic
/// message. Declining does not stop the build from travelling on.
pub fn handle_build_request(
    identity: &RouterIdentity,
    table: &mut TransitTable,
    mut build: ShortTunnelBuild,
    now_ms: u64,
) -> Result<BuildResponse> {
    let ident = IdentHash::from_bytes(identity.ident_hash());
    let index = build.find_record(&ident).ok_or(TunnelError::NotForUs)?;

    let (plaintext, mut state) = open_n(
        identity.encryption_secret(),
        &build.records[index][SHORT_REQUEST_RECORD_ENCRYPTED_OFFSET..],
    )?;
    let request = BuildRequestRecord::from_bytes(&plaintext)?;

    let requested_at = request.request_time_minutes as u64 * 60_000;
    if now_ms > requested_at + request.request_expiration as u64 * 1000 {
        debug!("Dropping stale build request for tunnel {}", request.receive_tunnel);
        return Err(TunnelError::StaleRequest);
    }

    let noise_hash = *state.hash();
    let keys = derive_hop_keys(&mut state, request.is_endpoint())?;

    let accepted = !table.is_full() && !table.contains(request.receive_tunnel);
    let code = if accepted {
        let role = if request.is_gateway() {
            TransitRole::Gateway
        } else if request.is_endpoint() {
            TransitRole::Endpoint
        } else {
            TransitRole::Participant
        };
        table.tunnels.insert(
            request.receive_tunnel,
            TransitTunnel {
                receive_tunnel: request.receive_tunnel,
                next_tunnel: request.next_tunnel,
                next_ident: request.next_ident,
                role,
                created: now_ms,
                layer: LayerCipher::new(LayerKeys::new(keys.layer_key, keys.iv_key)),
                endpoint: (role == TransitRole::Endpoint).then(TunnelEndpoint::new),
            },
        );
        trace!("Joined tunnel {} as {:?}", request.receive_tunnel, role);
        return_code::ACCEPT
    } else {
        debug!("Declining tunnel {}", request.receive_tunnel);
        return_code::REJECT_BANDWIDTH
    };

    let response = aead::encrypt(
        &keys.reply_key,
        &nonce_from_counter(index as u64),
        &noise_hash,
        &response_cleartext(code),
    )?;
    build.records[index].copy_from_slice(&response);

    for (j, record) in build.records.iter_mut().enumerate() {
        if j != index {
            mask_record(&keys.reply_key, j, record);
        }
    }

    let message = if request.is_endpoint() {
        let reply = I2npMessage::with_id(
            I2npMessageType::ShortTunnelBuildReply,
            request.send_msg_id,
            build.to_bytes(),
        );
        wrap_one_time(
            &keys.garlic_key,
            &keys.garlic_tag,
            &[Clove::new(CloveDelivery::Local, reply)],
        )?
    } else {
        I2npMessage::with_id(
            I2npMessageType::ShortTunnelBuild,
            request.send_msg_id,
            build.to_bytes(),
        )
    };

    Ok(BuildResponse {
        accepted,
        to: request.next_ident,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{create_build_request, decrypt_build_reply};
    use crate::test_util::peer;
    use veil_garlic::{GarlicConfig, GarlicProcessor, Recipient};
    use veil_protocol::types::now_millis;
    use veil_protocol::Direction;

    #[test]
    fn test_not_addressed_to_us() {
        let (_, a) = peer(0);
        let (stranger, _) = peer(1);
        let (build, _) =
            create_build_request(Direction::Inbound, &[a], IdentHash::from_bytes([1u8; 32])).unwrap();
        let mut table = TransitTable::new(10);
        assert_eq!(
            handle_build_request(&stranger, &mut table, build, now_millis()).unwrap_err(),
            TunnelError::NotForUs
        );
    }

    #[test]
    fn test_stale_request_dropped() {
        let (identity, record) = peer(0);
        let (build, _) =
            create_build_request(Direction::Inbound, &[record], IdentHash::from_bytes([1u8; 32])).unwrap();
        let mut table = TransitTable::new(10);
        let later = now_millis() + 3600 * 1000;
        assert_eq!(
            handle_build_request(&identity, &mut table, build, later).unwrap_err(),
            TunnelError::StaleRequest
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_table_declines_but_forwards() {
        let (identity, record) = peer(0);
        let local = IdentHash::from_bytes([1u8; 32]);
        let (build, secrets) = create_build_request(Direction::Inbound, &[record], local).unwrap();
        let mut table = TransitTable::new(0);

        let response = handle_build_request(&identity, &mut table, build, now_millis()).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.to, local);
        assert_eq!(response.message.msg_id, secrets.reply_msg_id);

        let mut reply = ShortTunnelBuild::from_bytes(&response.message.payload).unwrap();
        let codes = decrypt_build_reply(&secrets, &mut reply.records).unwrap();
        assert_eq!(codes, vec![return_code::REJECT_BANDWIDTH]);
    }

    #[tokio::test]
    async fn test_outbound_endpoint_replies_in_garlic() {
        let hops: Vec<_> = (0..2).map(peer).collect();
        let path: Vec<_> = hops.iter().map(|(_, r)| r.clone()).collect();
        let local = IdentHash::from_bytes([1u8; 32]);
        let (mut build, secrets) = create_build_request(Direction::Outbound, &path, local).unwrap();

        let mut last = None;
        for (identity, _) in &hops {
            let mut table = TransitTable::new(10);
            let response = handle_build_request(identity, &mut table, build.clone(), now_millis()).unwrap();
            if response.message.msg_type == I2npMessageType::ShortTunnelBuild {
                build = ShortTunnelBuild::from_bytes(&response.message.payload).unwrap();
            } else {
                assert_eq!(table.get(secrets.hops[1].receive_tunnel).unwrap().role, TransitRole::Endpoint);
                last = Some(response);
            }
        }

        let response = last.unwrap();
        assert_eq!(response.to, local);
        assert_eq!(response.message.msg_type, I2npMessageType::Garlic);

        let garlic = GarlicProcessor::new(GarlicConfig::default());
        let (tag, key) = secrets.reply_garlic.unwrap();
        garlic.register_one_time_key(tag, key).await;
        let creator = veil_crypto::X25519StaticSecret::random_from_rng(rand::rngs::OsRng);
        let cloves = garlic
            .unwrap(Recipient::Router(&creator), &response.message)
            .await
            .unwrap();
        assert_eq!(cloves.len(), 1);
        let reply = &cloves[0].message;
        assert_eq!(reply.msg_type, I2npMessageType::ShortTunnelBuildReply);
        assert_eq!(reply.msg_id, secrets.reply_msg_id);

        let mut records = ShortTunnelBuild::from_bytes(&reply.payload).unwrap().records;
        assert_eq!(decrypt_build_reply(&secrets, &mut records).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_duplicate_receive_id_declined() {
        let (identity, record) = peer(0);
        let local = IdentHash::from_bytes([1u8; 32]);
        let (build, _) = create_build_request(Direction::Inbound, &[record], local).unwrap();
        let mut table = TransitTable::new(10);
        assert!(handle_build_request(&identity, &mut table, build.clone(), now_millis()).unwrap().accepted);
        assert!(!handle_build_request(&identity, &mut table, build, now_millis()).unwrap().accepted);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_tunnel_and_expiry() {
        let (identity, record) = peer(0);
        let (build, secrets) =
            create_build_request(Direction::Inbound, &[record], IdentHash::from_bytes([1u8; 32])).unwrap();
        let mut table = TransitTable::new(10);
        let now = now_millis();
        handle_build_request(&identity, &mut table, build, now).unwrap();

        let data = TunnelDataMessage::new(12345, vec![0u8; 1024]).unwrap();
        assert_eq!(
            table.handle_tunnel_data(&data, now).unwrap_err(),
            TunnelError::UnknownTunnel(12345)
        );
        assert!(table.contains(secrets.hops[0].receive_tunnel));
        assert_eq!(table.expire(now + TUNNEL_EXPIRATION_TIMEOUT_MS), 1);
        assert!(table.is_empty());
    }
}
