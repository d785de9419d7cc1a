//! Upstream node set, health probing, and primary election.
//!
//! The upstream list is fixed at startup; only the health flags and the
//! primary index move. Election is deterministic: the first healthy upstream
//! in declared order wins, and with no healthy upstream the previous primary
//! is kept so the proxy can keep serving its last-known template.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::UpstreamConfig;
use crate::rpc::NodeClient;

pub struct Upstream {
    pub client: NodeClient,
    healthy: AtomicBool,
}

impl Upstream {
    pub fn name(&self) -> &str {
        &self.client.name
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

pub struct UpstreamSet {
    upstreams: Vec<Upstream>,
    primary: AtomicUsize,
}

impl UpstreamSet {
    pub fn new(configs: &[UpstreamConfig]) -> Result<Self, String> {
        let mut upstreams = Vec::with_capacity(configs.len());
        for cfg in configs {
            let client =
                NodeClient::new(&cfg.name, &cfg.url, Duration::from_millis(cfg.timeout_ms))?;
            // Optimistic until the first probe says otherwise.
            upstreams.push(Upstream { client, healthy: AtomicBool::new(true) });
        }
        if upstreams.is_empty() {
            return Err("no upstreams configured".into());
        }
        Ok(Self { upstreams, primary: AtomicUsize::new(0) })
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn primary_index(&self) -> usize {
        self.primary.load(Ordering::Relaxed)
    }

    /// The currently elected upstream. In-flight calls that raced an election
    /// simply finish against the node they started with.
    pub fn primary(&self) -> &Upstream {
        &self.upstreams[self.primary_index()]
    }

    pub fn get(&self, index: usize) -> &Upstream {
        &self.upstreams[index]
    }

    pub fn mark_healthy(&self, index: usize, healthy: bool) {
        self.upstreams[index].healthy.store(healthy, Ordering::Relaxed);
    }

    /// First healthy upstream by declared order; previous primary when none.
    /// Returns the new index when it changed.
    pub fn elect_primary(&self) -> Option<usize> {
        let candidate = self.upstreams.iter().position(|u| u.is_healthy())?;
        let previous = self.primary.swap(candidate, Ordering::Relaxed);
        (previous != candidate).then_some(candidate)
    }

    /// One probe cycle: check every upstream, update flags, re-elect.
    pub async fn probe_all(&self) {
        for (i, upstream) in self.upstreams.iter().enumerate() {
            let was_healthy = upstream.is_healthy();
            match upstream.client.check().await {
                Ok(()) => {
                    if !was_healthy {
                        tracing::info!("✅ Upstream {} is back", upstream.name());
                    }
                    self.mark_healthy(i, true);
                }
                Err(e) => {
                    if was_healthy {
                        tracing::warn!("❌ Upstream {} failed check: {}", upstream.name(), e);
                    }
                    self.mark_healthy(i, false);
                }
            }
        }
        if let Some(new_primary) = self.elect_primary() {
            tracing::info!("📡 Primary upstream -> {}", self.get(new_primary).name());
        }
    }
}

pub async fn run_monitor(set: Arc<UpstreamSet>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        set.probe_all().await;
    }
}

/// Consecutive-failure counter behind the proxy's sick flag.
pub struct HealthCounter {
    fails: AtomicU64,
    max_fails: u64,
    enabled: bool,
}

impl HealthCounter {
    pub fn new(max_fails: u64, enabled: bool) -> Self {
        Self { fails: AtomicU64::new(0), max_fails, enabled }
    }

    pub fn record_failure(&self) -> u64 {
        self.fails.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset(&self) {
        self.fails.store(0, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.fails.load(Ordering::Relaxed)
    }

    pub fn is_sick(&self) -> bool {
        self.enabled && self.count() >= self.max_fails
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(n: usize) -> UpstreamSet {
        let configs: Vec<UpstreamConfig> = (0..n)
            .map(|i| UpstreamConfig {
                name: format!("node{}", i),
                url: format!("http://127.0.0.1:{}", 20000 + i),
                timeout_ms: 100,
            })
            .collect();
        UpstreamSet::new(&configs).unwrap()
    }

    #[test]
    fn test_first_healthy_wins() {
        let set = set_of(3);
        set.mark_healthy(0, false);
        set.mark_healthy(1, true);
        set.mark_healthy(2, true);
        assert_eq!(set.elect_primary(), Some(1));
        assert_eq!(set.primary_index(), 1);

        // Node 0 recovers: declared order beats incumbency.
        set.mark_healthy(0, true);
        assert_eq!(set.elect_primary(), Some(0));
        assert_eq!(set.primary().name(), "node0");
    }

    #[test]
    fn test_no_healthy_keeps_previous_primary() {
        let set = set_of(3);
        set.mark_healthy(0, false);
        set.mark_healthy(1, true);
        set.mark_healthy(2, false);
        set.elect_primary();
        assert_eq!(set.primary_index(), 1);

        set.mark_healthy(1, false);
        assert_eq!(set.elect_primary(), None);
        assert_eq!(set.primary_index(), 1, "last-known-good retained");
    }

    #[test]
    fn test_election_idempotent() {
        let set = set_of(2);
        assert_eq!(set.elect_primary(), None, "already at first healthy");
        assert_eq!(set.elect_primary(), None);
    }

    #[tokio::test]
    async fn test_probe_marks_unreachable_unhealthy() {
        // Nothing listens on these ports; every probe fails.
        let set = set_of(2);
        set.probe_all().await;
        assert!(!set.get(0).is_healthy());
        assert!(!set.get(1).is_healthy());
        assert_eq!(set.primary_index(), 0);
    }

    #[test]
    fn test_health_counter_law() {
        let counter = HealthCounter::new(3, true);
        assert!(!counter.is_sick());
        counter.record_failure();
        counter.record_failure();
        assert!(!counter.is_sick());
        counter.record_failure();
        assert!(counter.is_sick());
        counter.reset();
        assert!(!counter.is_sick());

        let disabled = HealthCounter::new(1, false);
        disabled.record_failure();
        disabled.record_failure();
        assert!(!disabled.is_sick(), "sickness gated on health_check");
    }
}
