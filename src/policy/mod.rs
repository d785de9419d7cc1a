//! Admission and abuse policy.
//!
//! Tracks misbehavior per miner IP: connect-rate overruns, malformed frames,
//! and invalid-share ratios. Enough of any of them and the IP is banned for
//! the configured duration. Bans are mirrored to storage so sibling proxy
//! instances converge; the login blacklist flows the other way, from config
//! and storage into memory.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{BanningConfig, LimitsConfig, PolicyConfig};
use crate::storage::Storage;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Idle per-IP records are dropped after this long.
const ENTRY_TTL: u64 = 3600;

/// Bonus allowance never grows past this multiple of the base limit.
const MAX_BONUS_FACTOR: u32 = 4;

#[derive(Default)]
struct IpEntry {
    banned_until: u64,
    // connect limiter
    connects: u32,
    bonus: u32,
    window_start: u64,
    // abuse counters
    malformed: u32,
    valid_shares: u64,
    invalid_shares: u64,
    over_limit_strikes: u8,
    last_seen: u64,
    login: Option<String>,
}

pub struct PolicyEngine {
    banning: BanningConfig,
    limits: LimitsConfig,
    entries: Mutex<HashMap<String, IpEntry>>,
    blacklist: RwLock<HashSet<String>>,
    storage: Arc<Storage>,
}

impl PolicyEngine {
    pub fn new(cfg: &PolicyConfig, storage: Arc<Storage>) -> Self {
        let blacklist: HashSet<String> =
            cfg.blacklist.iter().map(|l| l.to_lowercase()).collect();
        Self {
            banning: cfg.banning.clone(),
            limits: cfg.limits.clone(),
            entries: Mutex::new(HashMap::new()),
            blacklist: RwLock::new(blacklist),
            storage,
        }
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        if !self.banning.enabled {
            return false;
        }
        let entries = self.entries.lock();
        match entries.get(ip) {
            Some(entry) => entry.banned_until > unix_now(),
            None => false,
        }
    }

    /// Admission control for new connections: a fixed window of connect
    /// attempts per IP, with a bonus that grows `limit_jump` per clean window.
    pub fn apply_limit_policy(&self, ip: &str) -> bool {
        if !self.limits.enabled {
            return true;
        }
        let now = unix_now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(ip.to_string()).or_default();
        entry.last_seen = now;

        if now.saturating_sub(entry.window_start) >= self.limits.grace_s {
            if entry.window_start > 0 && entry.connects <= self.limits.limit + entry.bonus {
                entry.bonus = (entry.bonus + self.limits.limit_jump)
                    .min(self.limits.limit * MAX_BONUS_FACTOR);
            }
            entry.window_start = now;
            entry.connects = 0;
        }

        entry.connects += 1;
        let allowed = entry.connects <= self.limits.limit + entry.bonus;
        if !allowed {
            tracing::debug!("⏳ Rate limited {} ({} connects in window)", ip, entry.connects);
        }
        allowed
    }

    /// Login admission: blacklisted addresses and banned IPs are refused,
    /// otherwise the (ip, login) binding is recorded.
    pub fn apply_login_policy(&self, login: &str, ip: &str) -> bool {
        let login = login.to_lowercase();
        if self.blacklist.read().contains(&login) {
            tracing::warn!("🚫 Blacklisted login {} from {}", login, ip);
            return false;
        }
        if self.is_banned(ip) {
            return false;
        }
        let mut entries = self.entries.lock();
        let entry = entries.entry(ip.to_string()).or_default();
        entry.last_seen = unix_now();
        entry.login = Some(login);
        true
    }

    /// One tick per malformed request (bad JSON, oversize frame, bad params).
    pub fn apply_malformed_policy(&self, ip: &str) {
        let should_ban = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(ip.to_string()).or_default();
            entry.last_seen = unix_now();
            entry.malformed += 1;
            entry.malformed >= self.banning.malformed_limit
        };
        if should_ban {
            self.ban(ip, "malformed requests");
        }
    }

    /// Record a share verdict. Returns false once the invalid ratio in the
    /// current window crosses the threshold; two consecutive bad windows ban
    /// the IP.
    pub fn apply_share_policy(&self, ip: &str, valid: bool) -> bool {
        let (within_limit, should_ban) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(ip.to_string()).or_default();
            entry.last_seen = unix_now();
            if valid {
                entry.valid_shares += 1;
            } else {
                entry.invalid_shares += 1;
            }

            let total = entry.valid_shares + entry.invalid_shares;
            if total < self.banning.check_threshold {
                (true, false)
            } else {
                let percent = entry.invalid_shares as f64 * 100.0 / total as f64;
                let exceeded = percent >= self.banning.invalid_percent;
                entry.valid_shares = 0;
                entry.invalid_shares = 0;
                if exceeded {
                    entry.over_limit_strikes += 1;
                    tracing::warn!(
                        "⚠️  {}: {:.0}% invalid shares in window (strike {})",
                        ip,
                        percent,
                        entry.over_limit_strikes
                    );
                    (false, entry.over_limit_strikes >= 2)
                } else {
                    entry.over_limit_strikes = 0;
                    (true, false)
                }
            }
        };
        if should_ban {
            self.ban(ip, "invalid shares");
        }
        within_limit
    }

    /// Ban an IP for the configured duration and mirror it to storage.
    pub fn ban(&self, ip: &str, reason: &str) {
        if !self.banning.enabled {
            return;
        }
        let until = unix_now() + self.banning.ip_ban_duration_s;
        {
            let mut entries = self.entries.lock();
            let entry = entries.entry(ip.to_string()).or_default();
            entry.banned_until = until;
        }
        tracing::warn!("🚫 Banned {} for {}s: {}", ip, self.banning.ip_ban_duration_s, reason);

        // Fire-and-forget mirror; a failed write only costs cross-instance
        // visibility of this ban.
        let storage = self.storage.clone();
        let ip = ip.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = storage.write_ban(&ip, until) {
                        tracing::error!("Ban mirror for {} failed: {}", ip, e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = storage.write_ban(&ip, until) {
                    tracing::error!("Ban mirror for {} failed: {}", ip, e);
                }
            }
        }
    }

    /// Merge the storage blacklist on top of the configured one.
    pub fn refresh_blacklist(&self) {
        match self.storage.load_blacklist() {
            Ok(stored) => {
                let mut blacklist = self.blacklist.write();
                blacklist.extend(stored);
            }
            Err(e) => tracing::error!("Blacklist refresh failed: {}", e),
        }
    }

    /// Drop idle, unbanned records and expired bans.
    pub fn gc(&self) {
        let now = unix_now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.banned_until > now || now.saturating_sub(e.last_seen) < ENTRY_TTL);
        let dropped = before - entries.len();
        if dropped > 0 {
            tracing::debug!("♻️  Policy GC dropped {} idle records", dropped);
        }
    }

    pub fn banned_count(&self) -> usize {
        let now = unix_now();
        self.entries.lock().values().filter(|e| e.banned_until > now).count()
    }
}
