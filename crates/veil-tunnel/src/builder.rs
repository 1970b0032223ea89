//! Tunnel build attempts
//!
//! Every attempt lives in an arena keyed by its attempt id, which is the
//! message id the reply will carry. An attempt leaves the arena exactly once:
//! on a reply, on its deadline, or on a transport failure to the first hop.
//! Dropping the entry zeroizes its reply keys.

use std::collections::HashMap;
use tracing::{debug, trace};
use veil_garlic::SessionTag;
use veil_netdb::{BuildOutcome, SharedRecord};
use veil_protocol::build::BuildRecord;
use veil_protocol::types::random_msg_id;
use veil_protocol::{Direction, I2npMessage, I2npMessageType, IdentHash, TunnelId};

use crate::config::{create_build_request, decrypt_build_reply, BuildSecrets};
use crate::error::{Result, TunnelError};
use crate::tunnel::Tunnel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    RequestsSent,
    Confirmed,
    TimedOut,
    Rejected,
}

#[derive(Debug)]
struct PendingBuild {
    direction: Direction,
    secrets: BuildSecrets,
    deadline: u64,
    state: BuildState,
    replaces: Option<TunnelId>,
}

/// A build message ready for the first hop
#[derive(Debug)]
pub struct OutgoingBuild {
    pub attempt_id: u32,
    pub direction: Direction,
    pub first_hop: IdentHash,
    pub message: I2npMessage,
    /// One-time garlic key to register before sending (outbound builds)
    pub reply_key: Option<(SessionTag, [u8; 32])>,
}

/// How an attempt ended
#[derive(Debug)]
pub struct BuildCompletion {
    pub attempt_id: u32,
    pub direction: Direction,
    pub state: BuildState,
    pub replaces: Option<TunnelId>,
    pub result: Result<Tunnel>,
    /// Per-hop outcome for peer profiles
    pub outcomes: Vec<(IdentHash, BuildOutcome)>,
}

/// Arena of in-flight build attempts for one pool
#[derive(Debug)]
pub struct TunnelBuilder {
    local: IdentHash,
    timeout_ms: u64,
    lifetime_ms: u64,
    pending: HashMap<u32, PendingBuild>,
}

impl TunnelBuilder {
    pub fn new(local: IdentHash, timeout_ms: u64, lifetime_ms: u64) -> Self {
        TunnelBuilder {
            local,
            timeout_ms,
            lifetime_ms,
            pending: HashMap::new(),
        }
    }

    pub fn set_timeouts(&mut self, timeout_ms: u64, lifetime_ms: u64) {
        self.timeout_ms = timeout_ms;
        self.lifetime_ms = lifetime_ms;
    }

    /// Encrypt records for `path` and register the attempt
    pub fn start(
        &mut self,
        direction: Direction,
        path: &[SharedRecord],
        replaces: Option<TunnelId>,
        now: u64,
    ) -> Result<OutgoingBuild> {
        let (build, secrets) = create_build_request(direction, path, self.local)?;
        let attempt_id = secrets.reply_msg_id;
        let first_hop = path[0].ident_hash();
        let reply_key = secrets.reply_garlic;

        let mut entry = PendingBuild {
            direction,
            secrets,
            deadline: now + self.timeout_ms,
            state: BuildState::Idle,
            replaces,
        };
        let message = I2npMessage::with_id(
            I2npMessageType::ShortTunnelBuild,
            random_msg_id(),
            build.to_bytes(),
        );
        entry.state = BuildState::RequestsSent;
        self.pending.insert(attempt_id, entry);

        trace!("Build {} started ({}, {} hops)", attempt_id, direction, path.len());
        Ok(OutgoingBuild {
            attempt_id,
            direction,
            first_hop,
            message,
            reply_key,
        })
    }

    /// Finish an attempt with its reply records
    ///
    /// Returns `None` for attempts that already ended.
    pub fn handle_reply(&mut self, attempt_id: u32, mut records: Vec<BuildRecord>, now: u64) -> Option<BuildCompletion> {
        let entry = self.pending.remove(&attempt_id)?;
        let idents = entry.secrets.hop_idents();

        let (state, result, outcomes) = match decrypt_build_reply(&entry.secrets, &mut records) {
            Ok(codes) => match codes.iter().position(|c| *c != 0) {
                None => (
                    BuildState::Confirmed,
                    Ok(Tunnel::from_build(&entry.secrets, self.local, now, self.lifetime_ms)),
                    idents.iter().map(|i| (*i, BuildOutcome::Agreed)).collect(),
                ),
                Some(hop) => {
                    let outcomes = idents
                        .iter()
                        .zip(&codes)
                        .map(|(i, code)| {
                            let outcome = if *code == 0 {
                                BuildOutcome::Agreed
                            } else {
                                BuildOutcome::Declined
                            };
                            (*i, outcome)
                        })
                        .collect();
                    (
                        BuildState::Rejected,
                        Err(TunnelError::BuildRejected {
                            hop,
                            code: codes[hop],
                        }),
                        outcomes,
                    )
                }
            },
            Err(e) => {
                debug!("Undecryptable reply for build {}: {}", attempt_id, e);
                (BuildState::Rejected, Err(e), Vec::new())
            }
        };

        Some(BuildCompletion {
            attempt_id,
            direction: entry.direction,
            state,
            replaces: entry.replaces,
            result,
            outcomes,
        })
    }

    /// Time out every attempt whose deadline has passed
    pub fn sweep(&mut self, now: u64) -> Vec<BuildCompletion> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.state == BuildState::RequestsSent && now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|entry| (id, entry)))
            .map(|(attempt_id, entry)| BuildCompletion {
                attempt_id,
                direction: entry.direction,
                state: BuildState::TimedOut,
                replaces: entry.replaces,
                result: Err(TunnelError::BuildTimeout),
                outcomes: entry
                    .secrets
                    .hop_idents()
                    .into_iter()
                    .map(|i| (i, BuildOutcome::NoReply))
                    .collect(),
            })
            .collect()
    }

    /// End an attempt whose first hop could not be reached
    ///
    /// The request never left, so no hop is charged with a missing reply.
    pub fn fail_unreachable(&mut self, attempt_id: u32, first_hop: IdentHash) -> Option<BuildCompletion> {
        let entry = self.pending.remove(&attempt_id)?;
        Some(BuildCompletion {
            attempt_id,
            direction: entry.direction,
            state: BuildState::Rejected,
            replaces: entry.replaces,
            result: Err(TunnelError::TransportUnreachable(first_hop)),
            outcomes: Vec::new(),
        })
    }

    /// Drop every attempt, returning how many were cancelled
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn state(&self, attempt_id: u32) -> Option<BuildState> {
        self.pending.get(&attempt_id).map(|p| p.state)
    }

    pub fn contains(&self, attempt_id: u32) -> bool {
        self.pending.contains_key(&attempt_id)
    }

    pub fn pending_count(&self, direction: Direction) -> usize {
        self.pending.values().filter(|p| p.direction == direction).count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Peers on the paths of in-flight attempts in `direction`
    pub fn pending_peers(&self, direction: Direction) -> impl Iterator<Item = IdentHash> + '_ {
        self.pending
            .values()
            .filter(move |p| p.direction == direction)
            .flat_map(|p| p.secrets.hops.iter().map(|h| h.ident))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::peer;
    use crate::transit::{handle_build_request, TransitTable};
    use veil_protocol::types::now_millis;
    use veil_protocol::ShortTunnelBuild;

    fn builder() -> TunnelBuilder {
        TunnelBuilder::new(IdentHash::from_bytes([1u8; 32]), 30_000, 660_000)
    }

    #[test]
    fn test_timeout_fires_exactly_once() {
        let (_, a) = peer(0);
        let (_, b) = peer(1);
        let mut builder = builder();
        let out = builder.start(Direction::Outbound, &[a, b], None, 1000).unwrap();
        assert_eq!(builder.state(out.attempt_id), Some(BuildState::RequestsSent));
        assert!(out.reply_key.is_some());

        assert!(builder.sweep(30_999).is_empty());
        let done = builder.sweep(31_000);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].state, BuildState::TimedOut);
        assert_eq!(done[0].result.as_ref().unwrap_err(), &TunnelError::BuildTimeout);
        assert!(done[0].outcomes.iter().all(|(_, o)| *o == BuildOutcome::NoReply));

        assert!(builder.sweep(100_000).is_empty());
        assert!(!builder.contains(out.attempt_id));
        assert!(builder.handle_reply(out.attempt_id, Vec::new(), 100_000).is_none());
    }

    #[test]
    fn test_confirmed_build_yields_tunnel() {
        let hops: Vec<_> = (0..3).map(peer).collect();
        let path: Vec<_> = hops.iter().map(|(_, r)| r.clone()).collect();
        let mut builder = builder();
        let out = builder.start(Direction::Inbound, &path, Some(7), 0).unwrap();
        assert_eq!(out.first_hop, path[0].ident_hash());
        assert_eq!(builder.pending_count(Direction::Inbound), 1);
        assert_eq!(builder.pending_count(Direction::Outbound), 0);

        let mut build = ShortTunnelBuild::from_bytes(&out.message.payload).unwrap();
        let mut reply_id = 0;
        for (identity, _) in &hops {
            let mut table = TransitTable::new(10);
            let response = handle_build_request(identity, &mut table, build, now_millis()).unwrap();
            reply_id = response.message.msg_id;
            build = ShortTunnelBuild::from_bytes(&response.message.payload).unwrap();
        }
        assert_eq!(reply_id, out.attempt_id);

        let done = builder.handle_reply(reply_id, build.records, 5).unwrap();
        assert_eq!(done.state, BuildState::Confirmed);
        assert_eq!(done.replaces, Some(7));
        let tunnel = done.result.unwrap();
        assert_eq!(tunnel.hops().len(), 3);
        assert_eq!(tunnel.created(), 5);
        assert!(builder.is_empty());
    }

    #[test]
    fn test_rejection_names_the_declining_hop() {
        let hops: Vec<_> = (0..2).map(peer).collect();
        let path: Vec<_> = hops.iter().map(|(_, r)| r.clone()).collect();
        let mut builder = builder();
        let out = builder.start(Direction::Inbound, &path, None, 0).unwrap();

        let mut build = ShortTunnelBuild::from_bytes(&out.message.payload).unwrap();
        for (i, (identity, _)) in hops.iter().enumerate() {
            let mut table = TransitTable::new(if i == 1 { 0 } else { 10 });
            let response = handle_build_request(identity, &mut table, build, now_millis()).unwrap();
            build = ShortTunnelBuild::from_bytes(&response.message.payload).unwrap();
        }

        let done = builder.handle_reply(out.attempt_id, build.records, 0).unwrap();
        assert_eq!(done.state, BuildState::Rejected);
        assert_eq!(
            done.result.unwrap_err(),
            TunnelError::BuildRejected { hop: 1, code: 30 }
        );
        assert_eq!(done.outcomes[0].1, BuildOutcome::Agreed);
        assert_eq!(done.outcomes[1].1, BuildOutcome::Declined);
    }

    #[test]
    fn test_cancel_all() {
        let (_, a) = peer(0);
        let mut builder = builder();
        builder.start(Direction::Outbound, &[a.clone()], None, 0).unwrap();
        builder.start(Direction::Inbound, &[a], None, 0).unwrap();
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.cancel_all(), 2);
        assert!(builder.sweep(u64::MAX).is_empty());
    }
}
