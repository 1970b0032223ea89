//! Peer profiles
//!
//! Counters of how a peer has behaved as a tunnel hop, used to weight path
//! selection and to skip peers that keep declining or never answer.

use serde::{Deserialize, Serialize};
use veil_protocol::types::now_secs;

/// Declines with no agreement before a peer counts as always declining
const ALWAYS_DECLINING_THRESHOLD: u32 = 5;

/// Consecutive transport failures before a peer is considered unreachable
const TRANSPORT_FAILURE_THRESHOLD: u32 = 3;

/// Window after a failure during which the score is halved (seconds)
const RECENT_FAILURE_WINDOW: u64 = 600;

/// Outcome of asking a peer to join a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Agreed,
    Declined,
    NoReply,
}

/// Per-peer behaviour counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub tunnels_agreed: u32,
    pub tunnels_declined: u32,
    pub tunnels_non_replied: u32,

    pub transport_failures: u32,
    pub consecutive_transport_failures: u32,

    pub last_success: u64,
    pub last_failure: u64,
}

impl PeerProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_build(&mut self, outcome: BuildOutcome) {
        let now = now_secs();
        match outcome {
            BuildOutcome::Agreed => {
                self.tunnels_agreed += 1;
                self.last_success = now;
            }
            BuildOutcome::Declined => {
                self.tunnels_declined += 1;
                self.last_failure = now;
            }
            BuildOutcome::NoReply => {
                self.tunnels_non_replied += 1;
                self.last_failure = now;
            }
        }
    }

    pub fn record_transport_failure(&mut self) {
        self.transport_failures += 1;
        self.consecutive_transport_failures += 1;
        self.last_failure = now_secs();
    }

    pub fn record_transport_success(&mut self) {
        self.consecutive_transport_failures = 0;
    }

    fn is_always_declining(&self) -> bool {
        self.tunnels_agreed == 0 && self.tunnels_declined >= ALWAYS_DECLINING_THRESHOLD
    }

    fn is_low_participation(&self) -> bool {
        4 * self.tunnels_agreed < self.tunnels_declined
    }

    fn is_low_reply_rate(&self) -> bool {
        let total = self.tunnels_agreed + self.tunnels_declined;
        self.tunnels_non_replied > 10 * (total + 1)
    }

    /// Whether the selector should skip this peer
    pub fn is_bad(&self) -> bool {
        self.is_always_declining()
            || self.is_low_participation()
            || self.is_low_reply_rate()
            || self.consecutive_transport_failures >= TRANSPORT_FAILURE_THRESHOLD
    }

    /// Reliability score in `[0, 1]`
    ///
    /// Laplace-smoothed agreement rate, scaled down by consecutive
    /// transport failures and halved shortly after any failure. Unknown
    /// peers score 0.5.
    pub fn score(&self, now: u64) -> f64 {
        let attempts = self.tunnels_agreed + self.tunnels_declined + self.tunnels_non_replied;
        let reliability = (self.tunnels_agreed as f64 + 1.0) / (attempts as f64 + 2.0);

        let transport_factor = 0.8_f64.powi(self.consecutive_transport_failures as i32);

        let recency_factor =
            if self.last_failure > 0 && now.saturating_sub(self.last_failure) < RECENT_FAILURE_WINDOW {
                0.5
            } else {
                1.0
            };

        (reliability * transport_factor * recency_factor).clamp(0.0, 1.0)
    }
}

/// How often the selector took or skipped a peer
///
/// Updated on every path selection, so it lives beside the store snapshot
/// rather than in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionCounts {
    pub taken: u32,
    pub rejected: u32,
}

impl SelectionCounts {
    pub fn record_taken(&mut self) {
        self.taken += 1;
    }

    /// Note that the selector skipped this peer as bad
    ///
    /// Returns true once it has been skipped far more often than taken; the
    /// rejection count restarts and the caller should clear its profile.
    pub fn record_rejected(&mut self) -> bool {
        self.rejected += 1;
        if self.rejected > 10 * (self.taken + 1) {
            self.rejected = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peer_is_neutral() {
        let profile = PeerProfile::new();
        assert!(!profile.is_bad());
        assert!((profile.score(now_secs()) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_always_declining_is_bad() {
        let mut profile = PeerProfile::new();
        for _ in 0..4 {
            profile.record_build(BuildOutcome::Declined);
        }
        assert!(profile.is_bad()); // 4 * 0 < 4 already low participation

        let mut profile = PeerProfile::new();
        profile.record_build(BuildOutcome::Agreed);
        for _ in 0..4 {
            profile.record_build(BuildOutcome::Declined);
        }
        assert!(!profile.is_bad());
        profile.record_build(BuildOutcome::Declined);
        assert!(profile.is_bad());
    }

    #[test]
    fn test_low_reply_rate_is_bad() {
        let mut profile = PeerProfile::new();
        for _ in 0..10 {
            profile.record_build(BuildOutcome::NoReply);
        }
        assert!(!profile.is_bad());
        profile.record_build(BuildOutcome::NoReply);
        assert!(profile.is_bad());
    }

    #[test]
    fn test_transport_failures() {
        let mut profile = PeerProfile::new();
        for _ in 0..3 {
            profile.record_transport_failure();
        }
        assert!(profile.is_bad());
        profile.record_transport_success();
        assert!(!profile.is_bad());
        assert_eq!(profile.transport_failures, 3);
    }

    #[test]
    fn test_score_rewards_agreement() {
        let mut good = PeerProfile::new();
        let mut poor = PeerProfile::new();
        for _ in 0..10 {
            good.record_build(BuildOutcome::Agreed);
            poor.record_build(BuildOutcome::Agreed);
        }
        poor.record_build(BuildOutcome::NoReply);

        let now = now_secs();
        assert!(good.score(now) > poor.score(now));
        // Old failures stop halving the score
        assert!(poor.score(now + RECENT_FAILURE_WINDOW) > poor.score(now));
    }

    #[test]
    fn test_rejection_count_restarts() {
        let mut counts = SelectionCounts::default();
        counts.record_taken();
        for _ in 0..20 {
            assert!(!counts.record_rejected());
        }
        assert!(counts.record_rejected());
        assert_eq!(counts, SelectionCounts { taken: 1, rejected: 0 });
    }
}
