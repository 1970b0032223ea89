//! Garlic processor
//!
//! Wraps cloves for routers and destinations and unwraps inbound garlic.
//!
//! Garlic message payload: length (4 bytes) followed by one of
//! - one-shot: ephemeral key (32) || AEAD(blocks), Noise `N` against the
//!   recipient's static key
//! - session: tag (8) || AEAD(blocks), key and nonce from the session tag set,
//!   only after the remote acknowledged a one-shot handshake
//! - one-time: tag (8) || AEAD(blocks), key registered in advance, nonce 0
//!
//! Inbound failures are dropped here and never reach a caller.

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use veil_crypto::aead::{self, nonce_from_counter};
use veil_crypto::{open_n, seal_n, X25519StaticSecret};
use veil_protocol::types::{now_millis, now_secs, random_msg_id};
use veil_protocol::{I2npMessage, I2npMessageType, IdentHash, TunnelId};
use zeroize::Zeroizing;

use crate::block::{decode_blocks, encode_blocks, Block};
use crate::clove::{Clove, CloveDelivery};
use crate::error::{GarlicError, Result};
use crate::session::{InboundTable, OutboundSession};
use crate::tagset::{SessionTag, TagEntry, TagSet, SESSION_TAG_SIZE};

/// Maximum allowed clock difference on one-shot messages (seconds)
pub const MAX_CLOCK_SKEW: u64 = 120;

const LENGTH_SIZE: usize = 4;
const EPHEMERAL_KEY_SIZE: usize = 32;
const MAX_PADDING: usize = 16;

/// Garlic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarlicConfig {
    /// Idle time before a session is dropped (seconds)
    #[serde(default = "default_session_expiration")]
    pub session_expiration_secs: u64,

    /// Capacity of the one-time reply key table
    #[serde(default = "default_one_time_capacity")]
    pub one_time_tag_capacity: usize,

    /// Tags published ahead per inbound session
    #[serde(default = "default_tag_window")]
    pub tag_window: usize,
}

fn default_session_expiration() -> u64 {
    480
}

fn default_one_time_capacity() -> usize {
    1024
}

fn default_tag_window() -> usize {
    32
}

impl Default for GarlicConfig {
    fn default() -> Self {
        GarlicConfig {
            session_expiration_secs: default_session_expiration(),
            one_time_tag_capacity: default_one_time_capacity(),
            tag_window: default_tag_window(),
        }
    }
}

/// Which of our keys an inbound message is addressed to
///
/// Only destinations keep inbound sessions; routers only ever receive
/// one-shot and one-time messages.
#[derive(Clone, Copy)]
pub enum Recipient<'a> {
    Router(&'a X25519StaticSecret),
    Destination(&'a X25519StaticSecret),
}

impl Recipient<'_> {
    fn secret(&self) -> &X25519StaticSecret {
        match self {
            Recipient::Router(s) | Recipient::Destination(s) => s,
        }
    }
}

/// Receives unwrapped cloves, one call per delivery instruction
#[async_trait]
pub trait CloveHandler: Send + Sync {
    /// `Local` cloves arrive with `None`; `Destination` cloves with the hash
    async fn deliver_local(&self, destination: Option<IdentHash>, message: I2npMessage);

    async fn forward_to_tunnel(&self, gateway: IdentHash, tunnel_id: TunnelId, message: I2npMessage);

    async fn forward_to_router(&self, router: IdentHash, message: I2npMessage);
}

/// Encrypt a one-time message with a pre-shared key and tag
pub fn wrap_one_time(key: &[u8; 32], tag: &SessionTag, cloves: &[Clove]) -> Result<I2npMessage> {
    let payload = encode_payload(cloves, false)?;
    let ciphertext = aead::encrypt(key, &nonce_from_counter(0), tag, &payload)?;
    let mut body = Vec::with_capacity(SESSION_TAG_SIZE + ciphertext.len());
    body.extend_from_slice(tag);
    body.extend_from_slice(&ciphertext);
    Ok(garlic_message(&body))
}

fn encode_payload(cloves: &[Clove], with_datetime: bool) -> Result<Vec<u8>> {
    let mut blocks = Vec::with_capacity(cloves.len() + 2);
    if with_datetime {
        blocks.push(Block::DateTime(now_secs() as u32));
    }
    blocks.extend(cloves.iter().cloned().map(Block::Clove));
    let padding = rand::thread_rng().gen_range(0..=MAX_PADDING);
    if padding > 0 {
        blocks.push(Block::Padding(padding));
    }
    encode_blocks(&blocks)
}

fn garlic_message(body: &[u8]) -> I2npMessage {
    let mut payload = Vec::with_capacity(LENGTH_SIZE + body.len());
    payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
    payload.extend_from_slice(body);
    I2npMessage::new(I2npMessageType::Garlic, payload)
}

fn garlic_body(msg: &I2npMessage) -> Result<&[u8]> {
    let len_bytes: [u8; LENGTH_SIZE] = msg
        .payload
        .get(..LENGTH_SIZE)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| GarlicError::MalformedInstruction("missing garlic length".to_string()))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    msg.payload
        .get(LENGTH_SIZE..LENGTH_SIZE + len)
        .ok_or_else(|| GarlicError::MalformedInstruction("garlic length exceeds message".to_string()))
}

/// Session-aware garlic encryption and decryption
pub struct GarlicProcessor {
    config: GarlicConfig,
    outbound: DashMap<IdentHash, OutboundSession>,
    /// Acknowledgment id of an outstanding handshake -> remote
    pending_acks: DashMap<u32, IdentHash>,
    inbound: Mutex<InboundTable>,
    one_time: Mutex<LruCache<SessionTag, Zeroizing<[u8; 32]>>>,
}

impl GarlicProcessor {
    pub fn new(config: GarlicConfig) -> Self {
        let capacity = NonZeroUsize::new(config.one_time_tag_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        GarlicProcessor {
            config,
            outbound: DashMap::new(),
            pending_acks: DashMap::new(),
            inbound: Mutex::new(InboundTable::new()),
            one_time: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn config(&self) -> &GarlicConfig {
        &self.config
    }

    /// One-shot message to a router's static key
    pub fn wrap_for_router(&self, remote_static: &[u8; 32], cloves: &[Clove]) -> Result<I2npMessage> {
        let payload = encode_payload(cloves, true)?;
        let (sealed, _) = seal_n(remote_static, &payload)?;
        Ok(garlic_message(&sealed))
    }

    /// Message to a destination
    ///
    /// Until the remote has acknowledged a handshake every message is a
    /// one-shot. With a `reply` path each one-shot carries a DeliveryStatus
    /// clove sent back along it; pass the id to [`Self::confirm_session`] when
    /// it arrives. Without one the session never leaves one-shot mode.
    pub fn wrap_for_destination(
        &self,
        remote: IdentHash,
        remote_static: &[u8; 32],
        cloves: &[Clove],
        reply: Option<CloveDelivery>,
    ) -> Result<I2npMessage> {
        let now = now_secs();
        let expiration = self.config.session_expiration_secs;

        let expired = match self.outbound.get_mut(&remote) {
            Some(mut session) if !session.is_expired(now, expiration) => {
                if let Some(entry) = session.next_entry()? {
                    session.last_activity = now;
                    drop(session);
                    return self.wrap_tagged(remote, &entry, cloves);
                }
                false
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.forget(&remote);
        }

        let mut cloves = cloves.to_vec();
        let ack_id = reply.map(|delivery| {
            let ack_id = random_msg_id();
            cloves.push(Clove::new(delivery, I2npMessage::delivery_status(ack_id)));
            ack_id
        });

        let payload = encode_payload(&cloves, true)?;
        let (sealed, state) = seal_n(remote_static, &payload)?;

        if let Some(ack_id) = ack_id {
            let tagset = TagSet::from_chain_key(&state.chain_key())?;
            let evicted = {
                let mut session = self
                    .outbound
                    .entry(remote)
                    .or_insert_with(|| OutboundSession::new(now));
                session.last_activity = now;
                session.push_pending(ack_id, tagset)
            };
            if let Some(evicted) = evicted {
                self.pending_acks.remove(&evicted);
            }
            self.pending_acks.insert(ack_id, remote);
            debug!("Garlic handshake {} to {}", ack_id, remote);
        }
        Ok(garlic_message(&sealed))
    }

    fn wrap_tagged(&self, remote: IdentHash, entry: &TagEntry, cloves: &[Clove]) -> Result<I2npMessage> {
        let payload = encode_payload(cloves, false)?;
        let ciphertext = aead::encrypt(&entry.key, &nonce_from_counter(entry.index), &entry.tag, &payload)?;
        let mut body = Vec::with_capacity(SESSION_TAG_SIZE + ciphertext.len());
        body.extend_from_slice(&entry.tag);
        body.extend_from_slice(&ciphertext);
        trace!("Garlic to {} on session tag {}", remote, entry.index);
        Ok(garlic_message(&body))
    }

    /// Settle the handshake acknowledged by `ack_id`
    ///
    /// Returns false for ids that are not outstanding handshakes.
    pub fn confirm_session(&self, ack_id: u32) -> bool {
        let Some((_, remote)) = self.pending_acks.remove(&ack_id) else {
            return false;
        };
        let dropped = match self.outbound.get_mut(&remote) {
            Some(mut session) => session.confirm(ack_id),
            None => None,
        };
        match dropped {
            Some(dropped) => {
                for id in dropped {
                    self.pending_acks.remove(&id);
                }
                debug!("Garlic session to {} acknowledged", remote);
                true
            }
            None => false,
        }
    }

    fn forget(&self, remote: &IdentHash) -> Option<OutboundSession> {
        let (_, session) = self.outbound.remove(remote)?;
        for id in session.pending_ids() {
            self.pending_acks.remove(&id);
        }
        Some(session)
    }

    /// Forget the session to `remote` so the next message is a handshake
    pub fn reset_session(&self, remote: &IdentHash) -> bool {
        self.forget(remote).is_some()
    }

    /// Close the session to `remote`
    ///
    /// Returns a termination message when the session was acknowledged;
    /// an unconfirmed session is simply forgotten.
    pub fn terminate(&self, remote: &IdentHash) -> Result<Option<I2npMessage>> {
        let Some(mut session) = self.forget(remote) else {
            return Ok(None);
        };
        let Some(entry) = session.next_entry()? else {
            return Ok(None);
        };
        let payload = encode_blocks(&[Block::Termination(0)])?;
        let ciphertext = aead::encrypt(&entry.key, &nonce_from_counter(entry.index), &entry.tag, &payload)?;
        let mut body = Vec::with_capacity(SESSION_TAG_SIZE + ciphertext.len());
        body.extend_from_slice(&entry.tag);
        body.extend_from_slice(&ciphertext);
        Ok(Some(garlic_message(&body)))
    }

    pub fn has_session(&self, remote: &IdentHash) -> bool {
        self.outbound.contains_key(remote)
    }

    /// Whether messages to `remote` already travel on session tags
    pub fn is_established(&self, remote: &IdentHash) -> bool {
        self.outbound
            .get(remote)
            .map_or(false, |s| s.is_established())
    }

    /// Accept one message under `tag` encrypted with `key`
    pub async fn register_one_time_key(&self, tag: SessionTag, key: [u8; 32]) {
        self.one_time.lock().await.put(tag, Zeroizing::new(key));
    }

    /// Decrypt a garlic message into its cloves
    pub async fn unwrap(&self, recipient: Recipient<'_>, msg: &I2npMessage) -> Result<Vec<Clove>> {
        let body = garlic_body(msg)?;
        let now = now_secs();

        if body.len() > SESSION_TAG_SIZE {
            let mut tag = [0u8; SESSION_TAG_SIZE];
            tag.copy_from_slice(&body[..SESSION_TAG_SIZE]);
            let ciphertext = &body[SESSION_TAG_SIZE..];

            let one_time = self.one_time.lock().await.pop(&tag);
            if let Some(key) = one_time {
                let payload = aead::decrypt(&key, &nonce_from_counter(0), &tag, ciphertext)
                    .map_err(|_| GarlicError::DecryptionFailure)?;
                return Ok(Self::cloves(decode_blocks(&payload)?));
            }

            let mut inbound = self.inbound.lock().await;
            if let Some(found) = inbound.take(&tag, now)? {
                let payload = aead::decrypt(&found.key, &nonce_from_counter(found.index), &tag, ciphertext)
                    .map_err(|_| GarlicError::DecryptionFailure)?;
                let blocks = decode_blocks(&payload)?;
                if blocks.iter().any(|b| matches!(b, Block::Termination(_))) {
                    inbound.close(found.session_id);
                    debug!("Inbound garlic session closed by sender");
                }
                return Ok(Self::cloves(blocks));
            }
        }

        let (payload, state) =
            open_n(recipient.secret(), body).map_err(|_| GarlicError::DecryptionFailure)?;
        let blocks = decode_blocks(&payload)?;

        let timestamp = blocks.iter().find_map(|b| match b {
            Block::DateTime(ts) => Some(*ts as u64),
            _ => None,
        });
        match timestamp {
            Some(ts) if ts.abs_diff(now) <= MAX_CLOCK_SKEW => {}
            Some(ts) => {
                return Err(GarlicError::MalformedInstruction(format!(
                    "clock skew of {}s",
                    ts.abs_diff(now)
                )))
            }
            None => {
                return Err(GarlicError::MalformedInstruction(
                    "one-shot message without timestamp".to_string(),
                ))
            }
        }

        if let Recipient::Destination(_) = recipient {
            let tagset = TagSet::from_chain_key(&state.chain_key())?;
            self.inbound.lock().await.open(tagset, self.config.tag_window, now)?;
            debug!("Accepted new inbound garlic session");
        }

        Ok(Self::cloves(blocks))
    }

    fn cloves(blocks: Vec<Block>) -> Vec<Clove> {
        blocks
            .into_iter()
            .filter_map(|b| match b {
                Block::Clove(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Unwrap `msg` and hand each live clove to `handler`
    ///
    /// Returns the number of cloves dispatched. Undecryptable or malformed
    /// messages dispatch nothing.
    pub async fn handle_message(
        &self,
        recipient: Recipient<'_>,
        msg: &I2npMessage,
        handler: &dyn CloveHandler,
    ) -> usize {
        let cloves = match self.unwrap(recipient, msg).await {
            Ok(cloves) => cloves,
            Err(e) => {
                debug!("Dropping garlic message {}: {}", msg.msg_id, e);
                return 0;
            }
        };

        let now_ms = now_millis();
        let mut dispatched = 0;
        for clove in cloves {
            if clove.message.is_expired(now_ms) {
                debug!("Dropping expired clove {}", clove.message.msg_id);
                continue;
            }
            match clove.delivery {
                CloveDelivery::Local => handler.deliver_local(None, clove.message).await,
                CloveDelivery::Destination(hash) => {
                    handler.deliver_local(Some(hash), clove.message).await
                }
                CloveDelivery::Router(router) => handler.forward_to_router(router, clove.message).await,
                CloveDelivery::Tunnel { gateway, tunnel_id } => {
                    handler.forward_to_tunnel(gateway, tunnel_id, clove.message).await
                }
            }
            dispatched += 1;
        }
        dispatched
    }

    /// Drop idle sessions in both directions
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(now_secs()).await
    }

    pub async fn cleanup_at(&self, now: u64) -> usize {
        let expiration = self.config.session_expiration_secs;
        let expired: Vec<IdentHash> = self
            .outbound
            .iter()
            .filter(|s| s.is_expired(now, expiration))
            .map(|s| *s.key())
            .collect();
        let removed = expired.iter().filter(|r| self.forget(r).is_some()).count();
        removed + self.inbound.lock().await.expire(now, expiration)
    }

    /// Drop every session and key
    pub async fn clear(&self) {
        self.outbound.clear();
        self.pending_acks.clear();
        self.inbound.lock().await.clear();
        self.one_time.lock().await.clear();
    }

    pub fn outbound_session_count(&self) -> usize {
        self.outbound.len()
    }

    pub async fn inbound_session_count(&self) -> usize {
        self.inbound.lock().await.session_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use std::sync::Mutex as StdMutex;
    use veil_crypto::X25519PublicKey;

    fn keypair() -> (X25519StaticSecret, [u8; 32]) {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        let public = *X25519PublicKey::from(&secret).as_bytes();
        (secret, public)
    }

    fn data_clove(delivery: CloveDelivery, body: &[u8]) -> Clove {
        let mut msg = I2npMessage::new(I2npMessageType::Data, body.to_vec());
        msg.expiration = msg.expiration / 1000 * 1000 + 1000;
        Clove::new(delivery, msg)
    }

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl CloveHandler for Recorder {
        async fn deliver_local(&self, destination: Option<IdentHash>, message: I2npMessage) {
            let tag = destination.map(|d| d.to_string()).unwrap_or_else(|| "local".into());
            self.calls.lock().unwrap().push(format!("{}:{}", tag, message.payload.len()));
        }

        async fn forward_to_tunnel(&self, gateway: IdentHash, tunnel_id: TunnelId, _: I2npMessage) {
            self.calls.lock().unwrap().push(format!("tunnel:{}:{}", gateway, tunnel_id));
        }

        async fn forward_to_router(&self, router: IdentHash, _: I2npMessage) {
            self.calls.lock().unwrap().push(format!("router:{}", router));
        }
    }

    #[tokio::test]
    async fn test_router_one_shot() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();

        let clove = data_clove(CloveDelivery::Local, b"to the router");
        let msg = sender.wrap_for_router(&public, &[clove.clone()]).unwrap();
        let cloves = receiver.unwrap(Recipient::Router(&secret), &msg).await.unwrap();

        assert_eq!(cloves, vec![clove]);
        assert_eq!(receiver.inbound_session_count().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_key_is_decryption_failure() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (_, public) = keypair();
        let (other_secret, _) = keypair();

        let msg = sender
            .wrap_for_router(&public, &[data_clove(CloveDelivery::Local, b"secret")])
            .unwrap();
        assert_eq!(
            receiver.unwrap(Recipient::Router(&other_secret), &msg).await,
            Err(GarlicError::DecryptionFailure)
        );

        let handler = Recorder::default();
        assert_eq!(
            receiver
                .handle_message(Recipient::Router(&other_secret), &msg, &handler)
                .await,
            0
        );
        assert!(handler.calls.lock().unwrap().is_empty());
    }

    fn reply_path() -> Option<CloveDelivery> {
        Some(CloveDelivery::Tunnel {
            gateway: IdentHash::from_bytes([6u8; 32]),
            tunnel_id: 41,
        })
    }

    /// Acknowledgment id requested by a handshake, if any
    fn requested_ack(cloves: &[Clove]) -> Option<u32> {
        cloves
            .iter()
            .filter(|c| c.message.msg_type == I2npMessageType::DeliveryStatus)
            .find_map(|c| c.message.parse_delivery_status().ok())
    }

    /// Deliver a handshake and feed its acknowledgment back to the sender
    async fn establish(
        sender: &GarlicProcessor,
        receiver: &GarlicProcessor,
        secret: &X25519StaticSecret,
        public: &[u8; 32],
        remote: IdentHash,
    ) -> I2npMessage {
        let first = sender
            .wrap_for_destination(remote, public, &[data_clove(CloveDelivery::Local, b"one")], reply_path())
            .unwrap();
        let cloves = receiver.unwrap(Recipient::Destination(secret), &first).await.unwrap();
        assert!(sender.confirm_session(requested_ack(&cloves).unwrap()));
        first
    }

    #[tokio::test]
    async fn test_destination_session_switches_to_tags() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();
        let remote = IdentHash::from_bytes([8u8; 32]);

        let first = sender
            .wrap_for_destination(remote, &public, &[data_clove(CloveDelivery::Local, b"one")], reply_path())
            .unwrap();
        assert!(sender.has_session(&remote));
        assert!(!sender.is_established(&remote));

        let cloves = receiver.unwrap(Recipient::Destination(&secret), &first).await.unwrap();
        assert_eq!(cloves.len(), 2);
        assert_eq!(cloves[1].delivery, reply_path().unwrap());
        assert_eq!(receiver.inbound_session_count().await, 1);

        let ack = requested_ack(&cloves).unwrap();
        assert!(sender.confirm_session(ack));
        assert!(!sender.confirm_session(ack));
        assert!(sender.is_established(&remote));

        for i in 0..5u8 {
            let clove = data_clove(CloveDelivery::Local, &[i; 20]);
            let msg = sender
                .wrap_for_destination(remote, &public, &[clove.clone()], reply_path())
                .unwrap();
            // Tagged messages are smaller than one-shot ones
            assert!(msg.payload.len() < first.payload.len() + 20);
            let cloves = receiver.unwrap(Recipient::Destination(&secret), &msg).await.unwrap();
            assert_eq!(cloves, vec![clove]);
        }
        assert_eq!(receiver.inbound_session_count().await, 1);
    }

    #[tokio::test]
    async fn test_lost_handshake_keeps_one_shot() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();
        let remote = IdentHash::from_bytes([8u8; 32]);

        // Never delivered
        sender
            .wrap_for_destination(remote, &public, &[data_clove(CloveDelivery::Local, b"lost")], reply_path())
            .unwrap();

        // Later messages still open on the static key alone
        let mut acks = Vec::new();
        for i in 0..3u8 {
            let clove = data_clove(CloveDelivery::Local, &[i; 12]);
            let msg = sender
                .wrap_for_destination(remote, &public, &[clove.clone()], reply_path())
                .unwrap();
            let cloves = receiver.unwrap(Recipient::Destination(&secret), &msg).await.unwrap();
            assert_eq!(cloves[0], clove);
            acks.push(requested_ack(&cloves).unwrap());
        }
        assert!(!sender.is_established(&remote));

        // A late acknowledgment of any delivered handshake settles the session
        assert!(sender.confirm_session(acks[1]));
        assert!(!sender.confirm_session(acks[2]));
        let clove = data_clove(CloveDelivery::Local, b"tagged");
        let msg = sender
            .wrap_for_destination(remote, &public, &[clove.clone()], reply_path())
            .unwrap();
        assert_eq!(
            receiver.unwrap(Recipient::Destination(&secret), &msg).await.unwrap(),
            vec![clove]
        );
    }

    #[tokio::test]
    async fn test_no_reply_path_never_uses_tags() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();
        let remote = IdentHash::from_bytes([5u8; 32]);

        for _ in 0..2 {
            let clove = data_clove(CloveDelivery::Local, b"plain");
            let msg = sender.wrap_for_destination(remote, &public, &[clove.clone()], None).unwrap();
            let cloves = receiver.unwrap(Recipient::Destination(&secret), &msg).await.unwrap();
            assert_eq!(cloves, vec![clove]);
        }
        assert!(!sender.has_session(&remote));
    }

    #[tokio::test]
    async fn test_reset_session_returns_to_handshakes() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();
        let remote = IdentHash::from_bytes([7u8; 32]);

        establish(&sender, &receiver, &secret, &public, remote).await;
        assert!(sender.reset_session(&remote));
        assert!(!sender.reset_session(&remote));

        let msg = sender
            .wrap_for_destination(remote, &public, &[data_clove(CloveDelivery::Local, b"again")], reply_path())
            .unwrap();
        assert!(!sender.is_established(&remote));
        let cloves = receiver.unwrap(Recipient::Destination(&secret), &msg).await.unwrap();
        assert!(requested_ack(&cloves).is_some());
        assert_eq!(receiver.inbound_session_count().await, 2);
    }

    #[tokio::test]
    async fn test_replayed_tag_rejected() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();
        let remote = IdentHash::from_bytes([8u8; 32]);
        establish(&sender, &receiver, &secret, &public, remote).await;

        let msg = sender
            .wrap_for_destination(remote, &public, &[data_clove(CloveDelivery::Local, b"two")], None)
            .unwrap();
        assert!(receiver.unwrap(Recipient::Destination(&secret), &msg).await.is_ok());
        assert_eq!(
            receiver.unwrap(Recipient::Destination(&secret), &msg).await,
            Err(GarlicError::DecryptionFailure)
        );
    }

    #[tokio::test]
    async fn test_one_time_key_used_once() {
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, _) = keypair();
        let key = [0x42u8; 32];
        let tag = [9u8; SESSION_TAG_SIZE];
        receiver.register_one_time_key(tag, key).await;

        let clove = data_clove(CloveDelivery::Local, b"build reply");
        let msg = wrap_one_time(&key, &tag, &[clove.clone()]).unwrap();

        assert_eq!(
            receiver.unwrap(Recipient::Router(&secret), &msg).await.unwrap(),
            vec![clove]
        );
        assert_eq!(
            receiver.unwrap(Recipient::Router(&secret), &msg).await,
            Err(GarlicError::DecryptionFailure)
        );
    }

    #[tokio::test]
    async fn test_termination_closes_inbound_session() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();
        let remote = IdentHash::from_bytes([1u8; 32]);

        establish(&sender, &receiver, &secret, &public, remote).await;

        let bye = sender.terminate(&remote).unwrap().unwrap();
        assert!(!sender.has_session(&remote));
        assert!(receiver
            .unwrap(Recipient::Destination(&secret), &bye)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(receiver.inbound_session_count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_by_delivery_instruction() {
        let sender = GarlicProcessor::new(GarlicConfig::default());
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, public) = keypair();
        let dest = IdentHash::from_bytes([1u8; 32]);
        let router = IdentHash::from_bytes([2u8; 32]);
        let gateway = IdentHash::from_bytes([3u8; 32]);

        let mut expired = data_clove(CloveDelivery::Local, b"stale");
        expired.message.expiration = 1000;

        let cloves = vec![
            data_clove(CloveDelivery::Local, b"abc"),
            data_clove(CloveDelivery::Destination(dest), b"abcd"),
            data_clove(CloveDelivery::Router(router), b"x"),
            data_clove(
                CloveDelivery::Tunnel {
                    gateway,
                    tunnel_id: 55,
                },
                b"y",
            ),
            expired,
        ];
        let msg = sender.wrap_for_router(&public, &cloves).unwrap();

        let handler = Recorder::default();
        let dispatched = receiver
            .handle_message(Recipient::Router(&secret), &msg, &handler)
            .await;

        assert_eq!(dispatched, 4);
        let calls = handler.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "local:3".to_string(),
                format!("{}:4", dest),
                format!("router:{}", router),
                format!("tunnel:{}:55", gateway),
            ]
        );
    }

    #[tokio::test]
    async fn test_truncated_message_is_malformed() {
        let receiver = GarlicProcessor::new(GarlicConfig::default());
        let (secret, _) = keypair();
        let mut msg = I2npMessage::new(I2npMessageType::Garlic, vec![0, 0, 1, 0, 1, 2]);
        assert!(matches!(
            receiver.unwrap(Recipient::Router(&secret), &msg).await,
            Err(GarlicError::MalformedInstruction(_))
        ));
        msg.payload = vec![0, 0, 0, 60];
        msg.payload.extend([7u8; 60]);
        assert_eq!(
            receiver.unwrap(Recipient::Router(&secret), &msg).await,
            Err(GarlicError::DecryptionFailure)
        );
    }

    #[tokio::test]
    async fn test_cleanup_expires_sessions() {
        let config = GarlicConfig {
            session_expiration_secs: 60,
            ..GarlicConfig::default()
        };
        let sender = GarlicProcessor::new(config.clone());
        let receiver = GarlicProcessor::new(config);
        let (secret, public) = keypair();
        let remote = IdentHash::from_bytes([4u8; 32]);
        establish(&sender, &receiver, &secret, &public, remote).await;
        assert_eq!(sender.outbound_session_count(), 1);

        let now = now_secs();
        assert_eq!(sender.cleanup_at(now + 30).await, 0);
        assert_eq!(sender.cleanup_at(now + 120).await, 1);
        assert_eq!(receiver.cleanup_at(now + 120).await, 1);
        assert_eq!(sender.outbound_session_count(), 0);
        assert_eq!(receiver.inbound_session_count().await, 0);
    }
}
