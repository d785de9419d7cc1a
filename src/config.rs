//! Proxy configuration, loaded from a JSON file.
//!
//! Every section has serde defaults so a minimal config only needs `name`
//! and one upstream; `Config::load` validates the rest.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Instance identifier, written with every node-state record.
    pub name: String,
    pub upstream: Vec<UpstreamConfig>,
    #[serde(default = "default_upstream_check_interval")]
    pub upstream_check_interval_s: u64,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    /// `http://host:port[/path]`
    pub url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// HTTP getwork bind address.
    pub listen: String,
    pub limit_headers_size: usize,
    pub limit_body_size: usize,
    pub behind_reverse_proxy: bool,
    /// Pool share difficulty. Shares are checked against 2^256 / difficulty.
    pub difficulty: u64,
    pub block_refresh_interval_ms: u64,
    pub state_update_interval_s: u64,
    pub hashrate_expiration_s: u64,
    pub health_check: bool,
    pub max_fails: u64,
    pub stratum: StratumConfig,
    pub policy: PolicyConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8546".into(),
            limit_headers_size: 1024,
            limit_body_size: 4096,
            behind_reverse_proxy: false,
            difficulty: 2_000_000_000,
            block_refresh_interval_ms: 120,
            state_update_interval_s: 3,
            hashrate_expiration_s: 3600,
            health_check: true,
            max_fails: 100,
            stratum: StratumConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    pub enabled: bool,
    pub listen: String,
    /// Base read deadline. Halved once more than 1000 sessions are live,
    /// never below 5 seconds.
    pub timeout_s: u64,
    /// Sessions idle longer than this are reaped.
    pub ping_timeout_s: u64,
    pub max_conn: usize,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:8008".into(),
            timeout_s: 120,
            ping_timeout_s: 90,
            max_conn: 8192,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub banning: BanningConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Login addresses refused at submitLogin, merged with the storage mirror.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanningConfig {
    pub enabled: bool,
    pub ip_ban_duration_s: u64,
    /// Malformed requests tolerated before the source IP is banned.
    pub malformed_limit: u32,
    /// Shares in a window before the invalid ratio is enforced.
    pub check_threshold: u64,
    /// Maximum tolerated invalid share percentage within a window.
    pub invalid_percent: f64,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_ban_duration_s: 3600,
            malformed_limit: 5,
            check_threshold: 30,
            invalid_percent: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub enabled: bool,
    /// Connection attempts allowed per grace window.
    pub limit: u32,
    pub grace_s: u64,
    /// Allowance added after every clean window.
    pub limit_jump: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { enabled: true, limit: 30, grace_s: 300, limit_jump: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: "hashpool_data".into() }
    }
}

fn default_upstream_check_interval() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    10_000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("read {}: {}", path.as_ref().display(), e))?;
        let cfg: Config = serde_json::from_str(&data).map_err(|e| format!("parse config: {}", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("config: name must not be empty".into());
        }
        if self.upstream.is_empty() {
            return Err("config: at least one upstream is required".into());
        }
        if self.proxy.difficulty == 0 {
            return Err("config: proxy.difficulty must be positive".into());
        }
        if self.proxy.stratum.max_conn == 0 {
            return Err("config: proxy.stratum.max_conn must be positive".into());
        }
        if self.upstream_check_interval_s == 0
            || self.proxy.block_refresh_interval_ms == 0
            || self.proxy.state_update_interval_s == 0
        {
            return Err("config: refresh and check intervals must be positive".into());
        }
        Ok(())
    }

    pub fn upstream_check_interval(&self) -> Duration {
        Duration::from_secs(self.upstream_check_interval_s)
    }

    pub fn block_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.proxy.block_refresh_interval_ms)
    }

    pub fn state_update_interval(&self) -> Duration {
        Duration::from_secs(self.proxy.state_update_interval_s)
    }
}
