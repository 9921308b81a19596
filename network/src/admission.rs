//! Peer admission (C11): hard connection caps, per-peer rate limiting,
//! and the Sybil/eclipse defenses that keep any one network vantage
//! point from dominating the connection set (§4.11).

use crate::config::NetworkParams;
use crate::peer::PeerRegistry;
use shared::ReasonCode;
use std::collections::HashMap;
use std::net::IpAddr;

/// Token-bucket rate limiter for inbound messages from a single peer.
/// Refills at `rate_per_sec` tokens/second up to `rate_per_sec` capacity;
/// each message costs one token.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: i64,
}

impl TokenBucket {
    fn new(rate_per_sec: u32, now: i64) -> Self {
        Self {
            tokens: f64::from(rate_per_sec),
            capacity: f64::from(rate_per_sec),
            rate_per_sec: f64::from(rate_per_sec),
            last_refill: now,
        }
    }

    fn try_consume(&mut self, now: i64) -> bool {
        let elapsed = (now - self.last_refill).max(0) as f64;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Tracks admission state not already carried on `PeerRecord`: rate
/// limiters, repeat-offense counters for exponential ban back-off, and
/// the optional trusted allow-list (§4.11).
pub struct Admission {
    params: NetworkParams,
    buckets: HashMap<String, TokenBucket>,
    offenses: HashMap<String, u32>,
    trusted: std::collections::HashSet<String>,
}

impl Admission {
    #[must_use]
    pub fn new(params: NetworkParams) -> Self {
        Self { params, buckets: HashMap::new(), offenses: HashMap::new(), trusted: std::collections::HashSet::new() }
    }

    pub fn trust(&mut self, fingerprint: impl Into<String>) {
        self.trusted.insert(fingerprint.into());
    }

    fn is_trusted(&self, fingerprint: &str) -> bool {
        self.trusted.contains(fingerprint)
    }

    /// Decides whether a candidate peer may be admitted given the
    /// currently connected set in `registry`. Trusted peers bypass the
    /// numeric caps but are still subject to validation elsewhere
    /// (§4.11 "bypasses caps but not validation").
    pub fn admit(&self, registry: &PeerRegistry, candidate_ip: IpAddr, now: i64, fingerprint: Option<&str>) -> Result<(), ReasonCode> {
        if let Some(fp) = fingerprint {
            if self.is_trusted(fp) {
                return Ok(());
            }
        }

        if registry.len() >= self.params.max_peers_total {
            return Err(ReasonCode::SubnetCap);
        }

        let per_ip = registry.iter().filter(|p| p.ip == candidate_ip).count();
        if per_ip >= self.params.max_peers_per_ip {
            return Err(ReasonCode::SubnetCap);
        }

        let subnet = crate::peer::subnet_bucket(candidate_ip);
        let in_subnet = registry.count_in_subnet(&subnet);
        if in_subnet >= self.params.max_peers_per_subnet {
            return Err(ReasonCode::SubnetCap);
        }

        // Eclipse defense: admitting this peer must not push the number
        // of distinct subnets among existing connections below the
        // diversity floor, which matters once the registry is already at
        // or near capacity and every remaining slot would otherwise come
        // from the same handful of subnets.
        let would_be_total = registry.len() + 1;
        if would_be_total >= self.params.max_peers_total {
            let subnet_is_new = in_subnet == 0;
            let distinct = if subnet_is_new { registry.distinct_subnets() + 1 } else { registry.distinct_subnets() };
            if distinct < self.params.min_diverse_peers {
                return Err(ReasonCode::SubnetCap);
            }
        }

        let _ = now;
        Ok(())
    }

    /// Consumes one rate-limit token for `url`'s inbound message.
    /// Returns `false` (and records an offense) if the peer has
    /// exceeded its budget.
    pub fn check_rate_limit(&mut self, url: &str, now: i64) -> bool {
        let bucket = self.buckets.entry(url.to_string()).or_insert_with(|| TokenBucket::new(self.params.rate_limit_rps, now));
        let allowed = bucket.try_consume(now);
        if !allowed {
            *self.offenses.entry(url.to_string()).or_insert(0) += 1;
        }
        allowed
    }

    /// Ban duration for the next offense from `url`: `BAN_DURATION *
    /// 2^offenses`, capped at ~30 days so a permanently hostile peer
    /// does not overflow the timestamp arithmetic (§4.11 "repeat
    /// offenders receive exponential back-off").
    #[must_use]
    pub fn ban_duration_for(&self, url: &str) -> i64 {
        let offenses = self.offenses.get(url).copied().unwrap_or(0).min(20);
        let multiplier = 1i64.checked_shl(offenses).unwrap_or(i64::MAX);
        (self.params.ban_duration_secs as i64).saturating_mul(multiplier).min(30 * 24 * 3600)
    }

    pub fn record_offense(&mut self, url: &str) {
        *self.offenses.entry(url.to_string()).or_insert(0) += 1;
    }

    pub fn forget(&mut self, url: &str) {
        self.buckets.remove(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRecord;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn admits_a_peer_under_every_cap() {
        let registry = PeerRegistry::new();
        let admission = Admission::new(NetworkParams::default());
        assert!(admission.admit(&registry, ip(1, 2, 3, 4), 0, None).is_ok());
    }

    #[test]
    fn rejects_once_the_total_cap_is_reached() {
        let mut registry = PeerRegistry::new();
        let params = NetworkParams { max_peers_total: 1, ..NetworkParams::default() };
        registry.insert(PeerRecord::new("existing", ip(9, 9, 9, 9), 0, false));
        let admission = Admission::new(params);
        assert_eq!(admission.admit(&registry, ip(1, 2, 3, 4), 0, None), Err(ReasonCode::SubnetCap));
    }

    #[test]
    fn rejects_beyond_the_per_subnet_cap() {
        let mut registry = PeerRegistry::new();
        let params = NetworkParams { max_peers_per_subnet: 2, max_peers_total: 100, ..NetworkParams::default() };
        registry.insert(PeerRecord::new("a", ip(10, 0, 0, 1), 0, false));
        registry.insert(PeerRecord::new("b", ip(10, 0, 0, 2), 0, false));
        let admission = Admission::new(params);
        assert_eq!(admission.admit(&registry, ip(10, 0, 0, 3), 0, None), Err(ReasonCode::SubnetCap));
    }

    #[test]
    fn trusted_fingerprints_bypass_the_caps() {
        let mut registry = PeerRegistry::new();
        let params = NetworkParams { max_peers_total: 0, ..NetworkParams::default() };
        registry.insert(PeerRecord::new("a", ip(1, 1, 1, 1), 0, false));
        let mut admission = Admission::new(params);
        admission.trust("trusted-key");
        assert!(admission.admit(&registry, ip(2, 2, 2, 2), 0, Some("trusted-key")).is_ok());
    }

    #[test]
    fn rate_limit_breach_is_denied_and_recorded() {
        let params = NetworkParams { rate_limit_rps: 1, ..NetworkParams::default() };
        let mut admission = Admission::new(params);
        assert!(admission.check_rate_limit("peer", 0));
        assert!(!admission.check_rate_limit("peer", 0));
        assert!(admission.ban_duration_for("peer") > admission.params.ban_duration_secs);
    }

    #[test]
    fn ban_duration_grows_exponentially_with_repeat_offenses() {
        let mut admission = Admission::new(NetworkParams::default());
        let first = admission.ban_duration_for("peer");
        admission.record_offense("peer");
        let second = admission.ban_duration_for("peer");
        admission.record_offense("peer");
        let third = admission.ban_duration_for("peer");
        assert!(first < second);
        assert!(second < third);
    }
}
