//! Per-destination state
//!
//! Each local destination owns a shard holding its tunnel pool (and through
//! it the build arena) and its bounded outbound queue. Shards are locked
//! independently so destinations never wait on one another.

use std::collections::VecDeque;
use std::sync::Arc;
use veil_protocol::IdentHash;
use veil_tunnel::TunnelPool;

use crate::error::{Result, RouterError};
use crate::lease::LocalDestination;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub to: IdentHash,
    pub payload: Vec<u8>,
    pub queued_at: u64,
}

#[derive(Debug)]
pub struct DestinationShard {
    pub destination: Arc<LocalDestination>,
    pub pool: TunnelPool,
    queue: VecDeque<QueuedMessage>,
    queue_capacity: usize,
}

impl DestinationShard {
    pub fn new(destination: Arc<LocalDestination>, pool: TunnelPool, queue_capacity: usize) -> Self {
        DestinationShard {
            destination,
            pool,
            queue: VecDeque::new(),
            queue_capacity,
        }
    }

    pub fn ident(&self) -> IdentHash {
        self.destination.ident
    }

    /// Queue a payload for `to`, refusing once the queue is full
    pub fn enqueue(&mut self, to: IdentHash, payload: Vec<u8>, now: u64) -> Result<()> {
        if self.queue.len() >= self.queue_capacity {
            return Err(RouterError::QueueFull(self.destination.ident));
        }
        self.queue.push_back(QueuedMessage {
            to,
            payload,
            queued_at: now,
        });
        Ok(())
    }

    pub fn front(&self) -> Option<&QueuedMessage> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.queue.pop_front()
    }

    /// Put a message back at the head of the queue
    pub fn requeue(&mut self, message: QueuedMessage) {
        self.queue.push_front(message);
    }

    /// Drop messages queued before `cutoff`
    pub fn drop_older_than(&mut self, cutoff: u64) -> usize {
        let before = self.queue.len();
        self.queue.retain(|m| m.queued_at >= cutoff);
        before - self.queue.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
