//! Peer Policy
//!
//! Tracks per-IP connection counts and a decaying misbehavior score,
//! and issues bans once the score crosses the threshold. Bans carry an
//! expiry; while a ban is live no connection from that address is
//! accepted. When banning is disabled by configuration, offending
//! clients are shadow-banned by client id instead: they stay connected
//! but are excluded from broadcasts and share credit.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info};

/// Score at which a ban is issued
pub const BAN_SCORE_THRESHOLD: u32 = 10;

/// Every score is decremented by one at this interval
pub const SCORE_DRAIN_INTERVAL: Duration = Duration::from_secs(10);

/// Default ban length: fifteen minutes
pub const BAN_TTL_MS: i64 = 15 * 60 * 1000;

/// A live ban against a remote address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    /// Epoch milliseconds the ban lifts at
    pub until_ms: i64,

    /// Machine-readable reason
    pub reason: Option<String>,

    /// Human-readable explanation
    pub message: Option<String>,

    /// Protocol version the client should upgrade to
    pub version_expected: Option<u32>,
}

/// What the server must do after a policy decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAction {
    /// Nothing; the offense was only scored
    None,

    /// Send `mining.disconnect` with this entry, then close the socket
    Ban(BanEntry),

    /// Keep the socket open but shadow-ban the client id
    ShadowBan,
}

#[derive(Debug, Default)]
struct PeerRecord {
    connections: u32,
    score: u32,
    ban: Option<BanEntry>,
}

impl PeerRecord {
    fn is_idle(&self) -> bool {
        self.connections == 0 && self.score == 0 && self.ban.is_none()
    }
}

/// Per-IP connection and ban state
pub struct PeerPolicy {
    records: Mutex<HashMap<IpAddr, PeerRecord>>,
    shadow_banned: Mutex<HashSet<u64>>,
    max_connections_per_ip: u32,
    banning: bool,
}

impl PeerPolicy {
    pub fn new(max_connections_per_ip: u32, banning: bool) -> Self {
        PeerPolicy {
            records: Mutex::new(HashMap::new()),
            shadow_banned: Mutex::new(HashSet::new()),
            max_connections_per_ip,
            banning,
        }
    }

    /// Whether a new connection from `ip` may be accepted
    pub fn is_allowed(&self, ip: IpAddr, now_ms: i64) -> bool {
        let records = self.records.lock().unwrap();
        let record = match records.get(&ip) {
            Some(record) => record,
            None => return true,
        };

        if let Some(ban) = &record.ban {
            if now_ms < ban.until_ms {
                return false;
            }
        }

        self.max_connections_per_ip == 0 || record.connections < self.max_connections_per_ip
    }

    /// Record an accepted connection
    pub fn connection_opened(&self, ip: IpAddr) {
        let mut records = self.records.lock().unwrap();
        records.entry(ip).or_default().connections += 1;
    }

    /// Record a closed connection
    pub fn connection_closed(&self, ip: IpAddr) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(&ip) {
            record.connections = record.connections.saturating_sub(1);
            if record.is_idle() {
                records.remove(&ip);
            }
        }
    }

    /// Add `amount` to the address's misbehavior score. Crossing the
    /// threshold clears the score and issues a ban.
    pub fn punish(&self, ip: IpAddr, amount: u32, now_ms: i64) -> PolicyAction {
        let crossed = {
            let mut records = self.records.lock().unwrap();
            let record = records.entry(ip).or_default();
            record.score += amount;
            debug!("Punished {}: score now {}", ip, record.score);

            if record.score >= BAN_SCORE_THRESHOLD {
                record.score = 0;
                true
            } else {
                false
            }
        };

        if crossed {
            self.ban(ip, Some("SCORE".to_string()), None, None, None, now_ms)
        } else {
            PolicyAction::None
        }
    }

    /// Ban an address. The effective expiry is the later of any
    /// existing ban and the requested one (default TTL when absent).
    /// With banning disabled this records nothing and asks the server
    /// to shadow-ban instead.
    pub fn ban(
        &self,
        ip: IpAddr,
        reason: Option<String>,
        message: Option<String>,
        until_ms: Option<i64>,
        version_expected: Option<u32>,
        now_ms: i64,
    ) -> PolicyAction {
        if !self.banning {
            debug!("Banning disabled; {} will be shadow-banned", ip);
            return PolicyAction::ShadowBan;
        }

        let mut records = self.records.lock().unwrap();
        let record = records.entry(ip).or_default();

        let mut until = until_ms.unwrap_or(now_ms + BAN_TTL_MS);
        if let Some(existing) = &record.ban {
            until = until.max(existing.until_ms);
        }

        let entry = BanEntry {
            until_ms: until,
            reason,
            message,
            version_expected,
        };
        record.ban = Some(entry.clone());

        info!(
            "Banned {} until {} ({})",
            ip,
            lodepool_util::format_timestamp_ms(until),
            entry.reason.as_deref().unwrap_or("unspecified")
        );
        PolicyAction::Ban(entry)
    }

    /// Exclude a client id from broadcasts and share credit without
    /// closing its socket
    pub fn shadow_ban(&self, client_id: u64) {
        info!("Shadow-banned client {}", client_id);
        self.shadow_banned.lock().unwrap().insert(client_id);
    }

    pub fn is_shadow_banned(&self, client_id: u64) -> bool {
        self.shadow_banned.lock().unwrap().contains(&client_id)
    }

    /// Forget a client id once its session is gone
    pub fn forget_client(&self, client_id: u64) {
        self.shadow_banned.lock().unwrap().remove(&client_id);
    }

    /// Decrement every score by one and drop expired bans. Invoked by
    /// the server's drain timer.
    pub fn drain_scores(&self, now_ms: i64) {
        let mut records = self.records.lock().unwrap();
        for record in records.values_mut() {
            record.score = record.score.saturating_sub(1);
            if let Some(ban) = &record.ban {
                if now_ms >= ban.until_ms {
                    record.ban = None;
                }
            }
        }
        records.retain(|_, record| !record.is_idle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    #[test]
    fn test_score_nine_does_not_ban() {
        let policy = PeerPolicy::new(0, true);
        assert_eq!(policy.punish(ip(), 9, 0), PolicyAction::None);
        assert!(policy.is_allowed(ip(), 0));
    }

    #[test]
    fn test_score_ten_bans() {
        let policy = PeerPolicy::new(0, true);
        policy.punish(ip(), 9, 0);
        let action = policy.punish(ip(), 1, 0);
        assert!(matches!(action, PolicyAction::Ban(_)));
        assert!(!policy.is_allowed(ip(), 0));
    }

    #[test]
    fn test_ban_expires() {
        let policy = PeerPolicy::new(0, true);
        policy.ban(ip(), None, None, Some(1_000), None, 0);
        assert!(!policy.is_allowed(ip(), 999));
        assert!(policy.is_allowed(ip(), 1_000));
    }

    #[test]
    fn test_ban_extends_not_shortens() {
        let policy = PeerPolicy::new(0, true);
        policy.ban(ip(), None, None, Some(5_000), None, 0);
        let action = policy.ban(ip(), None, None, Some(2_000), None, 0);
        match action {
            PolicyAction::Ban(entry) => assert_eq!(entry.until_ms, 5_000),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_default_ttl_applied() {
        let policy = PeerPolicy::new(0, true);
        match policy.ban(ip(), None, None, None, None, 1_000) {
            PolicyAction::Ban(entry) => assert_eq!(entry.until_ms, 1_000 + BAN_TTL_MS),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_banning_disabled_asks_for_shadow_ban() {
        let policy = PeerPolicy::new(0, false);
        assert_eq!(
            policy.ban(ip(), None, None, None, None, 0),
            PolicyAction::ShadowBan
        );
        // No ban entry was recorded.
        assert!(policy.is_allowed(ip(), 0));
    }

    #[test]
    fn test_connection_cap() {
        let policy = PeerPolicy::new(2, true);
        assert!(policy.is_allowed(ip(), 0));
        policy.connection_opened(ip());
        policy.connection_opened(ip());
        assert!(!policy.is_allowed(ip(), 0));
        policy.connection_closed(ip());
        assert!(policy.is_allowed(ip(), 0));
    }

    #[test]
    fn test_zero_cap_disables_limit() {
        let policy = PeerPolicy::new(0, true);
        for _ in 0..100 {
            policy.connection_opened(ip());
        }
        assert!(policy.is_allowed(ip(), 0));
    }

    #[test]
    fn test_drain_decrements_scores() {
        let policy = PeerPolicy::new(0, true);
        policy.punish(ip(), 9, 0);
        for _ in 0..9 {
            policy.drain_scores(0);
        }
        // The score fully drained, so nine more points still do not ban.
        assert_eq!(policy.punish(ip(), 9, 0), PolicyAction::None);
    }

    #[test]
    fn test_drain_drops_expired_bans() {
        let policy = PeerPolicy::new(0, true);
        policy.ban(ip(), None, None, Some(500), None, 0);
        policy.drain_scores(1_000);
        assert!(policy.is_allowed(ip(), 1_000));
    }

    #[test]
    fn test_shadow_ban_round_trip() {
        let policy = PeerPolicy::new(0, true);
        assert!(!policy.is_shadow_banned(7));
        policy.shadow_ban(7);
        assert!(policy.is_shadow_banned(7));
        policy.forget_client(7);
        assert!(!policy.is_shadow_banned(7));
    }
}
