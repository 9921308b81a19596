//! Propagation (C13): inbound dedup, per-peer bounded send queues, and
//! the per-peer connection state machine (§4.13).

use crate::dedup::DedupCache;
use crate::wire::WireMessage;
use shared::Hash256;
use std::collections::{HashMap, VecDeque};

/// Per-peer connection state (§4.13 "State machine"). Transitions not
/// reachable via [`PeerState::advance`] are programming errors at the
/// call site, not modeled as a fallible transition, since the actor
/// driving this only ever requests transitions the protocol allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Active,
    Syncing,
    Idle,
    Banned,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    HandshakeOk,
    HeaderMismatch,
    SyncComplete,
    RateLimitOrInvalidData,
    IdleTimeoutOrIoError,
}

impl PeerState {
    /// Applies a lifecycle event, returning the resulting state. Events
    /// not valid from the current state leave it unchanged, since a
    /// terminal state (`Banned`/`Disconnected`) never un-bans or
    /// un-disconnects itself from this transition alone (§4.13).
    #[must_use]
    pub fn advance(self, event: PeerEvent) -> Self {
        use PeerEvent::{HandshakeOk, HeaderMismatch, IdleTimeoutOrIoError, RateLimitOrInvalidData, SyncComplete};
        use PeerState::{Active, Banned, Disconnected, Handshaking, Idle, Syncing};
        match (self, event) {
            (_, RateLimitOrInvalidData) if self != Banned && self != Disconnected => Banned,
            (_, IdleTimeoutOrIoError) if self != Banned && self != Disconnected => Disconnected,
            (Handshaking, HandshakeOk) => Active,
            (Active, HeaderMismatch) => Syncing,
            (Syncing, SyncComplete) => Idle,
            (Idle, HeaderMismatch) => Syncing,
            other => other.0,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Banned | Self::Disconnected)
    }
}

/// A bounded outbound queue for one peer. Overflow drops the oldest
/// pending message rather than the newest, and reports the drop so the
/// caller can penalize the peer's quality score (§4.13 "overflow causes
/// the oldest message to be dropped").
pub struct PeerQueue {
    capacity: usize,
    messages: VecDeque<WireMessage>,
}

impl PeerQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), messages: VecDeque::with_capacity(capacity) }
    }

    /// Pushes `msg`. Returns `true` if an older message had to be
    /// dropped to make room.
    pub fn push(&mut self, msg: WireMessage) -> bool {
        let overflowed = if self.messages.len() >= self.capacity {
            self.messages.pop_front();
            true
        } else {
            false
        };
        self.messages.push_back(msg);
        overflowed
    }

    pub fn pop(&mut self) -> Option<WireMessage> {
        self.messages.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Outcome of offering a piece of content for propagation: which peers
/// received it queued, and which peers suffered a queue overflow (and
/// so should be penalized).
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub queued: Vec<String>,
    pub overflowed: Vec<String>,
}

/// Owns the dedup cache and every connected peer's outbound queue.
pub struct Propagation {
    dedup: DedupCache,
    queues: HashMap<String, PeerQueue>,
    max_peer_queue: usize,
}

impl Propagation {
    #[must_use]
    pub fn new(dedup_capacity: usize, max_peer_queue: usize) -> Self {
        Self { dedup: DedupCache::new(dedup_capacity), queues: HashMap::new(), max_peer_queue }
    }

    pub fn add_peer(&mut self, url: impl Into<String>) {
        self.queues.entry(url.into()).or_insert_with(|| PeerQueue::new(self.max_peer_queue));
    }

    pub fn remove_peer(&mut self, url: &str) {
        self.queues.remove(url);
    }

    /// Returns `false` if `hash` was already seen and the caller should
    /// not process or relay it again (§4.13 "Inbound dedup").
    pub fn admit(&mut self, hash: Hash256) -> bool {
        self.dedup.insert(hash)
    }

    /// Relays `msg` to every connected peer except `source` (a gossip
    /// echo back to the peer that sent it is redundant), queuing it per
    /// peer and reporting any overflow.
    pub fn relay(&mut self, source: Option<&str>, msg: &WireMessage) -> RelayOutcome {
        let mut outcome = RelayOutcome::default();
        for (url, queue) in &mut self.queues {
            if Some(url.as_str()) == source {
                continue;
            }
            if queue.push(msg.clone()) {
                outcome.overflowed.push(url.clone());
            }
            outcome.queued.push(url.clone());
        }
        outcome
    }

    pub fn drain_peer(&mut self, url: &str) -> Vec<WireMessage> {
        let Some(queue) = self.queues.get_mut(url) else { return Vec::new() };
        std::iter::from_fn(|| queue.pop()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::InvKind;

    fn inv(seed: u8) -> WireMessage {
        WireMessage::Inv { kind: InvKind::Block, hashes: vec![Hash256::keccak256(&[seed])] }
    }

    #[test]
    fn handshake_then_success_reaches_active() {
        let state = PeerState::Handshaking.advance(PeerEvent::HandshakeOk);
        assert_eq!(state, PeerState::Active);
    }

    #[test]
    fn a_rate_limit_breach_bans_from_any_non_terminal_state() {
        assert_eq!(PeerState::Active.advance(PeerEvent::RateLimitOrInvalidData), PeerState::Banned);
        assert_eq!(PeerState::Syncing.advance(PeerEvent::RateLimitOrInvalidData), PeerState::Banned);
    }

    #[test]
    fn banned_is_terminal_and_does_not_un_ban_on_further_events() {
        let banned = PeerState::Banned;
        assert!(banned.is_terminal());
        assert_eq!(banned.advance(PeerEvent::HandshakeOk), PeerState::Banned);
    }

    #[test]
    fn queue_overflow_drops_the_oldest_message() {
        let mut queue = PeerQueue::new(2);
        assert!(!queue.push(inv(1)));
        assert!(!queue.push(inv(2)));
        assert!(queue.push(inv(3)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn relay_skips_the_source_peer_and_queues_everyone_else() {
        let mut prop = Propagation::new(100, 10);
        prop.add_peer("a");
        prop.add_peer("b");
        prop.add_peer("c");

        let outcome = prop.relay(Some("a"), &inv(1));
        assert_eq!(outcome.queued.len(), 2);
        assert!(!outcome.queued.contains(&"a".to_string()));
    }

    #[test]
    fn dedup_admits_a_hash_only_once() {
        let mut prop = Propagation::new(10, 10);
        let h = Hash256::keccak256(b"x");
        assert!(prop.admit(h));
        assert!(!prop.admit(h));
    }
}
