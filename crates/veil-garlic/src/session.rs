//! Garlic sessions
//!
//! An outbound session is keyed by the remote destination. It starts out
//! unconfirmed: every message is a one-shot handshake carrying an
//! acknowledgment request, and each handshake would open its own tag set on
//! the remote side. The first acknowledgment picks the tag set both sides
//! share, and only then do messages switch to session tags.
//!
//! Inbound sessions are anonymous: they are only reachable through the
//! tags they have published into the shared tag table.

use std::collections::{HashMap, HashSet, VecDeque};
use veil_crypto::Result;
use zeroize::Zeroizing;

use crate::tagset::{SessionTag, TagEntry, TagSet};

/// Unacknowledged handshakes kept per session
pub const MAX_PENDING_HANDSHAKES: usize = 8;

/// Our side of a session we opened
#[derive(Debug)]
pub struct OutboundSession {
    /// Tag set the remote acknowledged
    tagset: Option<TagSet>,
    /// Handshakes awaiting acknowledgment, oldest first
    pending: VecDeque<(u32, TagSet)>,
    pub created: u64,
    pub last_activity: u64,
}

impl OutboundSession {
    pub fn new(now: u64) -> Self {
        OutboundSession {
            tagset: None,
            pending: VecDeque::new(),
            created: now,
            last_activity: now,
        }
    }

    pub fn is_expired(&self, now: u64, expiration: u64) -> bool {
        now.saturating_sub(self.last_activity) > expiration
    }

    pub fn is_established(&self) -> bool {
        self.tagset.is_some()
    }

    /// Next tag of an acknowledged session
    pub fn next_entry(&mut self) -> Result<Option<TagEntry>> {
        self.tagset.as_mut().map(TagSet::next_entry).transpose()
    }

    /// Remember a handshake until `ack_id` comes back
    ///
    /// Returns the id of a handshake evicted to make room.
    pub fn push_pending(&mut self, ack_id: u32, tagset: TagSet) -> Option<u32> {
        let evicted = if self.pending.len() >= MAX_PENDING_HANDSHAKES {
            self.pending.pop_front().map(|(id, _)| id)
        } else {
            None
        };
        self.pending.push_back((ack_id, tagset));
        evicted
    }

    /// Adopt the tag set of the acknowledged handshake
    ///
    /// Returns the ids of the other handshakes, which are dropped, or `None`
    /// when `ack_id` is not pending here.
    pub fn confirm(&mut self, ack_id: u32) -> Option<Vec<u32>> {
        let position = self.pending.iter().position(|(id, _)| *id == ack_id)?;
        let (_, tagset) = self.pending.remove(position)?;
        self.tagset = Some(tagset);
        Some(self.pending.drain(..).map(|(id, _)| id).collect())
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending.iter().map(|(id, _)| *id)
    }
}

#[derive(Debug)]
struct InboundSession {
    tagset: TagSet,
    last_activity: u64,
    outstanding: HashSet<SessionTag>,
}

/// Key material looked up by tag
pub struct TagKey {
    pub session_id: u64,
    pub index: u64,
    pub key: Zeroizing<[u8; 32]>,
}

/// Inbound sessions and the tags that lead to them
#[derive(Default)]
pub struct InboundTable {
    sessions: HashMap<u64, InboundSession>,
    tags: HashMap<SessionTag, TagKey>,
    next_session_id: u64,
}

impl InboundTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and publish `window` upcoming tags
    pub fn open(&mut self, mut tagset: TagSet, window: usize, now: u64) -> Result<u64> {
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let mut outstanding = HashSet::with_capacity(window);
        for _ in 0..window {
            let entry = tagset.next_entry()?;
            outstanding.insert(entry.tag);
            self.tags.insert(
                entry.tag,
                TagKey {
                    session_id,
                    index: entry.index,
                    key: entry.key,
                },
            );
        }

        self.sessions.insert(
            session_id,
            InboundSession {
                tagset,
                last_activity: now,
                outstanding,
            },
        );
        Ok(session_id)
    }

    /// Consume a tag, topping the session's window back up
    ///
    /// A tag is returned at most once.
    pub fn take(&mut self, tag: &SessionTag, now: u64) -> Result<Option<TagKey>> {
        let Some(found) = self.tags.remove(tag) else {
            return Ok(None);
        };
        if let Some(session) = self.sessions.get_mut(&found.session_id) {
            session.outstanding.remove(tag);
            session.last_activity = now;

            let entry = session.tagset.next_entry()?;
            session.outstanding.insert(entry.tag);
            self.tags.insert(
                entry.tag,
                TagKey {
                    session_id: found.session_id,
                    index: entry.index,
                    key: entry.key,
                },
            );
        }
        Ok(Some(found))
    }

    /// Drop a session and every tag it published
    pub fn close(&mut self, session_id: u64) -> bool {
        match self.sessions.remove(&session_id) {
            Some(session) => {
                for tag in &session.outstanding {
                    self.tags.remove(tag);
                }
                true
            }
            None => false,
        }
    }

    /// Close sessions idle for longer than `expiration` seconds
    pub fn expire(&mut self, now: u64, expiration: u64) -> usize {
        let expired: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.last_activity) > expiration)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.close(*id);
        }
        expired.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.tags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_consumed_once_and_refilled() {
        let mut table = InboundTable::new();
        let mut sender = TagSet::from_chain_key(&[3u8; 32]).unwrap();
        table.open(TagSet::from_chain_key(&[3u8; 32]).unwrap(), 4, 100).unwrap();
        assert_eq!(table.tag_count(), 4);

        let first = sender.next_entry().unwrap();
        let key = table.take(&first.tag, 101).unwrap().unwrap();
        assert_eq!(key.index, 0);
        assert_eq!(*key.key, *first.key);
        assert!(table.take(&first.tag, 101).unwrap().is_none());
        assert_eq!(table.tag_count(), 4);
    }

    #[test]
    fn test_out_of_order_tags_accepted() {
        let mut table = InboundTable::new();
        let mut sender = TagSet::from_chain_key(&[5u8; 32]).unwrap();
        table.open(TagSet::from_chain_key(&[5u8; 32]).unwrap(), 8, 0).unwrap();

        let a = sender.next_entry().unwrap();
        let b = sender.next_entry().unwrap();
        assert_eq!(table.take(&b.tag, 1).unwrap().unwrap().index, 1);
        assert_eq!(table.take(&a.tag, 1).unwrap().unwrap().index, 0);
    }

    #[test]
    fn test_outbound_session_confirms_one_handshake() {
        let mut session = OutboundSession::new(0);
        assert!(session.next_entry().unwrap().is_none());

        session.push_pending(1, TagSet::from_chain_key(&[1u8; 32]).unwrap());
        session.push_pending(2, TagSet::from_chain_key(&[2u8; 32]).unwrap());
        assert!(session.confirm(9).is_none());
        assert!(!session.is_established());

        assert_eq!(session.confirm(2), Some(vec![1]));
        assert!(session.is_established());
        assert_eq!(session.pending_ids().count(), 0);

        let mut expected = TagSet::from_chain_key(&[2u8; 32]).unwrap();
        assert_eq!(
            session.next_entry().unwrap().unwrap().tag,
            expected.next_entry().unwrap().tag
        );
    }

    #[test]
    fn test_pending_handshakes_are_bounded() {
        let mut session = OutboundSession::new(0);
        for id in 0..MAX_PENDING_HANDSHAKES as u32 {
            let tagset = TagSet::from_chain_key(&[id as u8; 32]).unwrap();
            assert!(session.push_pending(id, tagset).is_none());
        }
        let tagset = TagSet::from_chain_key(&[9u8; 32]).unwrap();
        assert_eq!(session.push_pending(100, tagset), Some(0));
        assert_eq!(session.pending_ids().count(), MAX_PENDING_HANDSHAKES);
    }

    #[test]
    fn test_expire_removes_tags() {
        let mut table = InboundTable::new();
        table.open(TagSet::from_chain_key(&[1u8; 32]).unwrap(), 4, 0).unwrap();
        table.open(TagSet::from_chain_key(&[2u8; 32]).unwrap(), 4, 400).unwrap();

        assert_eq!(table.expire(500, 480), 1);
        assert_eq!(table.session_count(), 1);
        assert_eq!(table.tag_count(), 4);
    }
}
