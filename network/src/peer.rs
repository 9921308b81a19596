//! Peer registry (C9): known peers, their connection history, and a
//! quality score derived from it (§3 "Peer record", §4.9). The registry
//! itself does no I/O; it is a pure bookkeeping structure that the
//! discovery, admission, sync, and propagation components consult and
//! update as the network actor observes real events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// IP range used for diversity accounting: /24 for IPv4, /64 for IPv6
/// (glossary "Subnet bucket").
#[must_use]
pub fn subnet_bucket(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0/24", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3])
        }
    }
}

/// A known peer and its connection history (§3 "Peer record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub url: String,
    pub ip: IpAddr,
    pub first_seen: i64,
    pub last_seen: i64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_ms: f64,
    pub is_bootstrap: bool,
    pub version: Option<String>,
    pub chain_height: Option<u64>,
    pub ban_until: Option<i64>,
}

impl PeerRecord {
    #[must_use]
    pub fn new(url: impl Into<String>, ip: IpAddr, now: i64, is_bootstrap: bool) -> Self {
        Self {
            url: url.into(),
            ip,
            first_seen: now,
            last_seen: now,
            success_count: 0,
            failure_count: 0,
            avg_response_ms: 0.0,
            is_bootstrap,
            version: None,
            chain_height: None,
            ban_until: None,
        }
    }

    #[must_use]
    pub fn subnet(&self) -> String {
        subnet_bucket(self.ip)
    }

    /// Fraction of attempts that succeeded; `1.0` for a peer with no
    /// history yet, so a brand-new peer is not penalized before it has
    /// had a chance to prove itself.
    #[must_use]
    pub fn reliability(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Current consecutive-failure streak is not tracked separately from
    /// `failure_count` here; callers that need a strict streak should
    /// reset `failure_count` to 0 on `record_success`. This registry
    /// keeps cumulative counts instead so long-lived good peers are not
    /// punished forever for a single historical blip.
    fn failure_streak_penalty(&self) -> f64 {
        const K: f64 = 5.0;
        (self.failure_count as f64 * K).min(100.0)
    }

    fn latency_penalty(&self) -> f64 {
        // Every 100ms of average response time costs one quality point,
        // capped so a slow-but-reliable peer is never driven to zero by
        // latency alone.
        (self.avg_response_ms / 100.0).min(40.0)
    }

    /// Quality score in `0..=100` (§4.9): `100 * reliability` minus a
    /// latency penalty and a failure-streak penalty, clamped.
    #[must_use]
    pub fn quality(&self) -> u32 {
        let raw = 100.0 * self.reliability() - self.latency_penalty() - self.failure_streak_penalty();
        raw.clamp(0.0, 100.0).round() as u32
    }

    #[must_use]
    pub fn is_banned_at(&self, now: i64) -> bool {
        self.ban_until.is_some_and(|until| now < until)
    }
}

/// In-memory table of known peers, keyed by `url` (§4.9).
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { peers: HashMap::new() }
    }

    pub fn insert(&mut self, record: PeerRecord) {
        self.peers.entry(record.url.clone()).or_insert(record);
    }

    #[must_use]
    pub fn get(&self, url: &str) -> Option<&PeerRecord> {
        self.peers.get(url)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Updates the rolling average response time with an exponentially
    /// weighted moving average (weight 0.2 on the new sample), records
    /// the success, and bumps `last_seen`.
    pub fn record_success(&mut self, url: &str, rt_ms: f64, now: i64) {
        if let Some(peer) = self.peers.get_mut(url) {
            peer.success_count += 1;
            peer.last_seen = now;
            peer.avg_response_ms = if peer.success_count == 1 {
                rt_ms
            } else {
                0.8 * peer.avg_response_ms + 0.2 * rt_ms
            };
        }
    }

    pub fn record_failure(&mut self, url: &str, now: i64) {
        if let Some(peer) = self.peers.get_mut(url) {
            peer.failure_count += 1;
            peer.last_seen = now;
        }
    }

    pub fn set_chain_height(&mut self, url: &str, height: u64) {
        if let Some(peer) = self.peers.get_mut(url) {
            peer.chain_height = Some(height);
        }
    }

    pub fn ban(&mut self, url: &str, until: i64) {
        if let Some(peer) = self.peers.get_mut(url) {
            peer.ban_until = Some(until);
        }
    }

    #[must_use]
    pub fn score(&self, url: &str) -> Option<u32> {
        self.peers.get(url).map(PeerRecord::quality)
    }

    pub fn evict_idle(&mut self, now: i64, max_idle_secs: i64) -> Vec<String> {
        let dead: Vec<String> = self
            .peers
            .values()
            .filter(|p| !p.is_bootstrap && now - p.last_seen > max_idle_secs)
            .map(|p| p.url.clone())
            .collect();
        for url in &dead {
            self.peers.remove(url);
        }
        dead
    }

    /// Selects up to `n` candidates from peers not in `exclude`,
    /// preferring the highest quality while avoiding piling multiple
    /// picks into the same subnet bucket (§4.9 "Selection prefers high
    /// quality, avoids multiple peers in the same subnet").
    #[must_use]
    pub fn pick_candidates(&self, n: usize, exclude: &[String], now: i64) -> Vec<String> {
        let mut candidates: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|p| !exclude.contains(&p.url) && !p.is_banned_at(now))
            .collect();
        candidates.sort_by(|a, b| b.quality().cmp(&a.quality()));

        let mut picked = Vec::with_capacity(n);
        let mut used_subnets: HashMap<String, usize> = HashMap::new();
        // First pass: take the best peer from each unseen subnet so the
        // result is diverse before we start doubling up.
        for peer in &candidates {
            if picked.len() >= n {
                break;
            }
            let subnet = peer.subnet();
            if !used_subnets.contains_key(&subnet) {
                used_subnets.insert(subnet, 1);
                picked.push(peer.url.clone());
            }
        }
        // Second pass: fill any remaining slots by quality regardless of
        // subnet repetition.
        for peer in &candidates {
            if picked.len() >= n {
                break;
            }
            if !picked.contains(&peer.url) {
                picked.push(peer.url.clone());
            }
        }
        picked
    }

    #[must_use]
    pub fn count_in_subnet(&self, subnet: &str) -> usize {
        self.peers.values().filter(|p| p.subnet() == subnet).count()
    }

    #[must_use]
    pub fn distinct_subnets(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        for p in self.peers.values() {
            seen.insert(p.subnet());
        }
        seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn subnet_bucket_groups_ipv4_by_slash_24() {
        assert_eq!(subnet_bucket(ip(10, 0, 0, 5)), subnet_bucket(ip(10, 0, 0, 200)));
        assert_ne!(subnet_bucket(ip(10, 0, 0, 5)), subnet_bucket(ip(10, 0, 1, 5)));
    }

    #[test]
    fn a_fresh_peer_has_perfect_reliability_and_full_quality() {
        let peer = PeerRecord::new("peer-a", ip(1, 2, 3, 4), 1_700_000_000, false);
        assert_eq!(peer.reliability(), 1.0);
        assert_eq!(peer.quality(), 100);
    }

    #[test]
    fn quality_drops_as_failures_accumulate() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("peer-a", ip(1, 2, 3, 4), 1_700_000_000, false));
        for _ in 0..5 {
            registry.record_failure("peer-a", 1_700_000_100);
        }
        let quality = registry.score("peer-a").unwrap();
        assert!(quality < 100, "expected quality to drop after repeated failures, got {quality}");
    }

    #[test]
    fn high_latency_costs_quality_even_with_perfect_reliability() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("peer-a", ip(1, 2, 3, 4), 1_700_000_000, false));
        registry.record_success("peer-a", 4_000.0, 1_700_000_100);
        let quality = registry.score("peer-a").unwrap();
        assert!(quality < 100);
    }

    #[test]
    fn idle_non_bootstrap_peers_are_evicted_but_bootstrap_peers_are_not() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("idle", ip(1, 1, 1, 1), 1_700_000_000, false));
        registry.insert(PeerRecord::new("anchor", ip(2, 2, 2, 2), 1_700_000_000, true));

        let evicted = registry.evict_idle(1_700_100_000, 900);
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("anchor").is_some());
    }

    #[test]
    fn pick_candidates_spreads_across_subnets_before_doubling_up() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("a1", ip(10, 0, 0, 1), 0, false));
        registry.insert(PeerRecord::new("a2", ip(10, 0, 0, 2), 0, false));
        registry.insert(PeerRecord::new("b1", ip(20, 0, 0, 1), 0, false));

        let picked = registry.pick_candidates(2, &[], 0);
        assert_eq!(picked.len(), 2);
        let subnets: std::collections::HashSet<String> =
            picked.iter().map(|url| registry.get(url).unwrap().subnet()).collect();
        assert_eq!(subnets.len(), 2, "expected the first two picks to come from distinct subnets");
    }

    #[test]
    fn banned_peers_are_excluded_from_candidates() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("a", ip(1, 1, 1, 1), 0, false));
        registry.ban("a", 1_000);
        let picked = registry.pick_candidates(5, &[], 500);
        assert!(picked.is_empty());
    }
}
