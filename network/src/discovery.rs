//! Discovery (C10): bootstrap connection, peer-list gossip, and the
//! periodic background top-up that keeps the connection count near
//! `target_peers` while preserving subnet diversity (§4.10).

use crate::config::NetworkParams;
use crate::peer::PeerRegistry;

/// A single discovery-tick decision: what the caller should do next.
/// Pure function of the registry and params, so the background loop
/// that drives this can be tested without any real networking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryPlan {
    /// Peers to actively connect to, to climb toward `target_peers`.
    pub connect: Vec<String>,
    /// Peers whose `last_seen` is stale and should be dropped.
    pub evict: Vec<String>,
    /// Over-represented subnet buckets to shed connections from first,
    /// in order of excess.
    pub rebalance_subnets: Vec<String>,
}

/// Computes one discovery tick: evict idle peers, then decide how many
/// additional connections (if any) are needed to reach `target_peers`,
/// then flag any subnet bucket holding more than its fair share so the
/// caller can prefer dropping from there on the next admission decision
/// (§4.10 "rebalancing to preserve subnet diversity").
#[must_use]
pub fn plan_tick(registry: &PeerRegistry, params: &NetworkParams, connected: &[String], now: i64) -> DiscoveryPlan {
    let evict = registry
        .iter()
        .filter(|p| connected.contains(&p.url) && !p.is_bootstrap && now - p.last_seen > params.peer_max_idle_secs)
        .map(|p| p.url.clone())
        .collect::<Vec<_>>();

    let remaining_connected: usize = connected.len().saturating_sub(evict.len());
    let deficit = params.target_peers.saturating_sub(remaining_connected);
    let connect = if deficit > 0 {
        registry.pick_candidates(deficit, connected, now)
    } else {
        Vec::new()
    };

    let rebalance_subnets = over_represented_subnets(registry, connected, params.max_peers_per_subnet);

    DiscoveryPlan { connect, evict, rebalance_subnets }
}

/// Subnets among `connected` peers whose share exceeds the per-subnet
/// cap, most-over-represented first.
fn over_represented_subnets(registry: &PeerRegistry, connected: &[String], max_peers_per_subnet: usize) -> Vec<String> {
    use std::collections::HashMap;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for url in connected {
        if let Some(peer) = registry.get(url) {
            *counts.entry(peer.subnet()).or_insert(0) += 1;
        }
    }
    let mut over: Vec<(String, usize)> =
        counts.into_iter().filter(|(_, count)| *count > max_peers_per_subnet).collect();
    over.sort_by(|a, b| b.1.cmp(&a.1));
    over.into_iter().map(|(subnet, _)| subnet).collect()
}

/// A diversity score in `0.0..=1.0`: the fraction of `connected` peers
/// that sit in a subnet bucket distinct from every other connected
/// peer's bucket (§4.10).
#[must_use]
pub fn diversity_score(registry: &PeerRegistry, connected: &[String]) -> f64 {
    if connected.is_empty() {
        return 1.0;
    }
    use std::collections::HashSet;
    let subnets: HashSet<String> =
        connected.iter().filter_map(|url| registry.get(url).map(PeerRecordSubnet::subnet)).collect();
    subnets.len() as f64 / connected.len() as f64
}

// Local alias so `diversity_score` reads naturally without importing
// `PeerRecord` just for its `subnet` method name.
use crate::peer::PeerRecord as PeerRecordSubnet;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRecord;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn plan_tick_tops_up_to_target_peers() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("a", ip(1, 1, 1, 1), 0, false));
        registry.insert(PeerRecord::new("b", ip(2, 2, 2, 2), 0, false));
        let params = NetworkParams { target_peers: 2, ..NetworkParams::default() };

        let plan = plan_tick(&registry, &params, &[], 1_000);
        assert_eq!(plan.connect.len(), 2);
    }

    #[test]
    fn plan_tick_evicts_idle_connected_peers() {
        let mut registry = PeerRegistry::new();
        let mut stale = PeerRecord::new("stale", ip(1, 1, 1, 1), 0, false);
        stale.last_seen = 0;
        registry.insert(stale);
        let params = NetworkParams { peer_max_idle_secs: 100, ..NetworkParams::default() };

        let plan = plan_tick(&registry, &params, &["stale".to_string()], 10_000);
        assert_eq!(plan.evict, vec!["stale".to_string()]);
    }

    #[test]
    fn diversity_score_is_one_when_every_peer_is_in_a_distinct_subnet() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("a", ip(1, 0, 0, 1), 0, false));
        registry.insert(PeerRecord::new("b", ip(2, 0, 0, 1), 0, false));
        let connected = vec!["a".to_string(), "b".to_string()];
        assert_eq!(diversity_score(&registry, &connected), 1.0);
    }

    #[test]
    fn diversity_score_drops_when_peers_share_a_subnet() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("a", ip(1, 0, 0, 1), 0, false));
        registry.insert(PeerRecord::new("b", ip(1, 0, 0, 2), 0, false));
        let connected = vec!["a".to_string(), "b".to_string()];
        assert_eq!(diversity_score(&registry, &connected), 0.5);
    }

    #[test]
    fn over_represented_subnets_are_flagged_worst_first() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerRecord::new("a", ip(1, 0, 0, 1), 0, false));
        registry.insert(PeerRecord::new("b", ip(1, 0, 0, 2), 0, false));
        registry.insert(PeerRecord::new("c", ip(1, 0, 0, 3), 0, false));
        let connected = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let over = over_represented_subnets(&registry, &connected, 2);
        assert_eq!(over, vec!["1.0.0.0/24".to_string()]);
    }
}
