//! The dispatch engine: shared state, the work refresh loop, the broadcast
//! fan-out, and the share pipeline both miner transports feed into.
//!
//! Data flow: the refresh loop writes the template cache; stratum, HTTP and
//! the broadcaster read it. The upstream monitor moves the primary index the
//! refresh loop and the block forwarder consult.

pub mod http;
pub mod stratum;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, RwLock, Semaphore};

use crate::config::Config;
use crate::policy::PolicyEngine;
use crate::pow::{self, Hash256, ShareVerifier, Verdict};
use crate::rpc::{self, RpcError, RpcResponse};
use crate::storage::{BlockCandidate, NodeState, ShareRecord, Storage};
use crate::template::{share_fingerprint, BlockTemplate, TemplateCache};
use crate::upstream::{HealthCounter, UpstreamSet};

use self::stratum::Session;

/// Concurrent outbound pushes during one broadcast.
const BROADCAST_CONCURRENCY: usize = 500;

/// Sessions above which the read deadline is halved.
const DEADLINE_HALVING_SESSIONS: usize = 1000;

/// Floor for the adaptive read deadline.
const MIN_READ_DEADLINE: Duration = Duration::from_secs(5);

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Identity of one submitter, however it reached us.
pub struct ShareOrigin {
    pub login: String,
    pub worker: String,
    pub ip: String,
    /// Stratum sessions must have logged in; HTTP callers carry their
    /// identity in the URL and always count as subscribed.
    pub subscribed: bool,
}

pub struct ProxyServer {
    pub cfg: Config,
    pub cache: TemplateCache,
    pub policy: Arc<PolicyEngine>,
    pub upstreams: Arc<UpstreamSet>,
    pub health: HealthCounter,
    pub storage: Arc<Storage>,
    verifier: Box<dyn ShareVerifier>,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    session_seq: AtomicU64,
    job_notify: Notify,
    pool_boundary: Hash256,
    pool_target_hex: String,
}

impl ProxyServer {
    pub fn new(
        cfg: Config,
        storage: Arc<Storage>,
        upstreams: Arc<UpstreamSet>,
        verifier: Box<dyn ShareVerifier>,
    ) -> Arc<Self> {
        let pool_boundary = pow::difficulty_to_boundary(cfg.proxy.difficulty);
        let share_log_capacity = cfg.proxy.stratum.max_conn.saturating_mul(3);
        let policy = Arc::new(PolicyEngine::new(&cfg.proxy.policy, storage.clone()));
        let health = HealthCounter::new(cfg.proxy.max_fails, cfg.proxy.health_check);
        Arc::new(Self {
            cache: TemplateCache::new(share_log_capacity),
            policy,
            upstreams,
            health,
            storage,
            verifier,
            sessions: RwLock::new(HashMap::new()),
            session_seq: AtomicU64::new(1),
            job_notify: Notify::new(),
            pool_boundary,
            pool_target_hex: pow::encode_hash(&pool_boundary),
            cfg,
        })
    }

    pub fn is_sick(&self) -> bool {
        self.health.is_sick()
    }

    pub fn pool_target(&self) -> &str {
        &self.pool_target_hex
    }

    // ─── Session registry ────────────────────────────────────────────

    pub fn next_session_id(&self) -> u64 {
        self.session_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register_session(&self, session: Arc<Session>) {
        self.sessions.write().await.insert(session.id, session);
    }

    /// Idempotent: reaper, broadcaster and the read loop may race here.
    pub async fn remove_session(&self, id: u64) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Close and remove every session idle beyond the ping timeout.
    pub async fn reap_idle(&self) -> usize {
        let limit = self.cfg.proxy.stratum.ping_timeout_s;
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<u64> = sessions
                .values()
                .filter(|s| s.idle_secs() >= limit)
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        let reaped = stale.len();
        for session in stale {
            tracing::debug!("⏱️  Reaping idle session {} ({})", session.id, session.ip);
            session.close().await;
        }
        reaped
    }

    /// Rolling read deadline, halved under heavy session load.
    pub async fn read_deadline(&self) -> Duration {
        let base = Duration::from_secs(self.cfg.proxy.stratum.timeout_s);
        if self.session_count().await > DEADLINE_HALVING_SESSIONS {
            (base / 2).max(MIN_READ_DEADLINE)
        } else {
            base.max(MIN_READ_DEADLINE)
        }
    }

    // ─── Miner-facing handlers (shared by stratum and HTTP) ──────────

    /// `[header, seed, poolTarget]` for the current template, if any. The
    /// last-known template keeps serving even while the proxy is sick.
    pub fn work_reply(&self) -> Option<[String; 3]> {
        let t = self.cache.current()?;
        if !t.is_ready() {
            return None;
        }
        Some([t.header.clone(), t.seed.clone(), self.pool_target_hex.clone()])
    }

    pub fn handle_get_work(&self, id: Value) -> RpcResponse {
        match self.work_reply() {
            Some(work) => rpc::success(id, json!(work)),
            None => rpc::failure(id, 0, "Work not ready"),
        }
    }

    pub fn handle_get_block_by_number(&self, id: Value) -> RpcResponse {
        let pending = self
            .cache
            .current()
            .and_then(|t| t.pending_block.clone())
            .unwrap_or(Value::Null);
        rpc::success(id, pending)
    }

    pub fn handle_submit_hashrate(&self, id: Value) -> RpcResponse {
        rpc::success(id, json!(true))
    }

    pub async fn handle_submit_work(&self, origin: &ShareOrigin, id: Value, params: &Value) -> RpcResponse {
        let (accepted, error) = self.process_share(origin, params).await;
        match error {
            Some(err) => rpc::failure(id, err.code, &err.message),
            None => rpc::success(id, json!(accepted)),
        }
    }

    /// The share pipeline. Each stage short-circuits; the return convention
    /// is `(accepted, error)` where an accepted share may still carry an
    /// error reply for a misbehaving-but-useful miner.
    async fn process_share(&self, origin: &ShareOrigin, params: &Value) -> (bool, Option<RpcError>) {
        if !origin.subscribed {
            return (false, reply(25, "Not subscribed"));
        }

        let items: Vec<&str> = params
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if items.len() != 3 {
            self.policy.apply_malformed_policy(&origin.ip);
            return (false, reply(-1, "Invalid params"));
        }
        let (nonce, pow_hash, mix_digest) = (items[0], items[1], items[2]);

        if !pow::valid_nonce(nonce) || !pow::valid_hash(pow_hash) || !pow::valid_hash(mix_digest) {
            self.policy.apply_malformed_policy(&origin.ip);
            return (false, reply(-1, "Malformed PoW result"));
        }

        // Height lookup doubles as the staleness check: headers that fell out
        // of the recent window are treated like any other invalid share.
        let height = match self.cache.height_of(pow_hash) {
            Some(h) => h,
            None => {
                tracing::debug!("Stale share from {}@{}", origin.login, origin.ip);
                return self.reject_invalid(origin);
            }
        };

        let fingerprint = share_fingerprint(height, pow_hash, nonce);
        if !self.cache.insert_share(&fingerprint) {
            tracing::debug!("Duplicate share from {}@{}", origin.login, origin.ip);
            self.policy.apply_share_policy(&origin.ip, false);
            return (false, reply(22, "Duplicate share"));
        }

        let (nonce_val, header_hash, mix_hash) =
            match (pow::parse_nonce(nonce), pow::parse_hash(pow_hash), pow::parse_hash(mix_digest)) {
                (Some(n), Some(h), Some(m)) => (n, h, m),
                _ => return (false, reply(-1, "Malformed PoW result")),
            };

        let template = match self.cache.current() {
            Some(t) if t.is_ready() => t,
            _ => return (false, None),
        };
        let network_boundary = pow::parse_hash(&template.target).unwrap_or([0u8; 32]);

        let verdict = self.verifier.verify(
            &header_hash,
            nonce_val,
            &mix_hash,
            &self.pool_boundary,
            &network_boundary,
        );
        if verdict == Verdict::Invalid {
            return self.reject_invalid(origin);
        }

        let is_block = verdict == Verdict::Block;
        if is_block {
            self.forward_block(origin, nonce, pow_hash, mix_digest, height);
        }
        self.record_share(origin, nonce, pow_hash, height, is_block);

        if !self.policy.apply_share_policy(&origin.ip, true) {
            return (true, reply(-1, "High rate of invalid shares"));
        }
        (true, None)
    }

    /// Invalid-share exit: silent drop inside the tolerance window, error 23
    /// once the policy trips.
    fn reject_invalid(&self, origin: &ShareOrigin) -> (bool, Option<RpcError>) {
        if !self.policy.apply_share_policy(&origin.ip, false) {
            return (false, reply(23, "Invalid share"));
        }
        (false, None)
    }

    /// Best-effort block submission to the primary; the reply to the miner
    /// never waits on the upstream.
    fn forward_block(&self, origin: &ShareOrigin, nonce: &str, pow_hash: &str, mix: &str, height: u64) {
        tracing::info!("🎉 Block candidate at height {} from {}@{}", height, origin.login, origin.ip);
        let client = self.upstreams.primary().client.clone();
        let (nonce, pow_hash, mix) = (nonce.to_string(), pow_hash.to_string(), mix.to_string());
        tokio::spawn(async move {
            match client.submit_work(&nonce, &pow_hash, &mix).await {
                Ok(true) => tracing::info!("✅ Upstream {} accepted block {}", client.name, pow_hash),
                Ok(false) => tracing::warn!("❌ Upstream {} rejected block {}", client.name, pow_hash),
                Err(e) => tracing::error!("Block submit to {} failed: {}", client.name, e),
            }
        });
    }

    fn record_share(&self, origin: &ShareOrigin, nonce: &str, pow_hash: &str, height: u64, is_block: bool) {
        let ts = unix_now();
        let share = ShareRecord {
            login: origin.login.clone(),
            worker: origin.worker.clone(),
            ip: origin.ip.clone(),
            difficulty: self.cfg.proxy.difficulty,
            height,
            is_block,
            ts,
        };
        if let Err(e) = self.storage.write_share(&share) {
            tracing::error!("Share write failed: {}", e);
        }
        if is_block {
            let candidate = BlockCandidate {
                login: origin.login.clone(),
                worker: origin.worker.clone(),
                ip: origin.ip.clone(),
                difficulty: self.cfg.proxy.difficulty,
                height,
                nonce: nonce.to_string(),
                header: pow_hash.to_string(),
                ts,
            };
            if let Err(e) = self.storage.write_block_candidate(&candidate) {
                tracing::error!("Block candidate write failed: {}", e);
            }
        }
    }

    // ─── Template refresh ────────────────────────────────────────────

    pub async fn run_refresh(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.block_refresh_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.fetch_work().await;
        }
    }

    async fn fetch_work(&self) {
        let client = self.upstreams.primary().client.clone();
        let work = match client.get_work().await {
            Ok(work) => work,
            Err(e) => {
                let fails = self.health.record_failure();
                tracing::error!("getWork from {} failed ({} fails): {}", client.name, fails, e);
                return;
            }
        };

        if let Some(current) = self.cache.current() {
            if current.header == work.header {
                return;
            }
        }

        // Best effort: a template without the pending block still mines.
        let pending_block = match client.get_pending_block().await {
            Ok(block) => Some(block),
            Err(e) => {
                tracing::warn!("Pending block from {} failed: {}", client.name, e);
                None
            }
        };

        let height = work
            .height
            .or_else(|| pending_height(pending_block.as_ref()))
            .unwrap_or_else(|| self.cache.current().map(|t| t.height + 1).unwrap_or(0));
        let difficulty = pow::parse_hash(&work.target)
            .map(|b| pow::boundary_to_difficulty(&b))
            .unwrap_or(0);

        let template = BlockTemplate {
            header: work.header,
            seed: work.seed,
            target: work.target,
            height,
            difficulty,
            pending_block,
        };
        if !template.is_ready() {
            return;
        }
        tracing::info!("🔨 New work at height {} (diff {})", height, difficulty);
        self.cache.publish(template);
        self.job_notify.notify_one();
    }

    // ─── Broadcast fan-out ───────────────────────────────────────────

    pub async fn run_broadcaster(self: Arc<Self>) {
        loop {
            self.job_notify.notified().await;
            self.broadcast_job().await;
        }
    }

    /// Push the current work to every live session, at most
    /// [`BROADCAST_CONCURRENCY`] writes in flight.
    pub async fn broadcast_job(&self) {
        if self.is_sick() {
            return;
        }
        let work = match self.work_reply() {
            Some(work) => work,
            None => return,
        };
        let sessions = self.sessions_snapshot().await;
        if sessions.is_empty() {
            return;
        }
        tracing::debug!("📣 Broadcasting job to {} sessions", sessions.len());

        // Joining every push keeps broadcasts sequential, which is what makes
        // per-session delivery follow publication order.
        let limiter = Arc::new(Semaphore::new(BROADCAST_CONCURRENCY));
        let mut pushes = Vec::with_capacity(sessions.len());
        for session in sessions {
            let Ok(permit) = limiter.clone().acquire_owned().await else {
                break;
            };
            let work = work.clone();
            pushes.push(tokio::spawn(async move {
                let result = session.push_work(&work).await;
                drop(permit);
                match result {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::debug!("Push to {} failed: {}", session.ip, e);
                        session.close().await;
                        Some(session.id)
                    }
                }
            }));
        }
        for push in pushes {
            if let Ok(Some(dead)) = push.await {
                self.remove_session(dead).await;
            }
        }
    }

    // ─── Node state + policy upkeep ──────────────────────────────────

    pub async fn run_state_updater(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.state_update_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.update_node_state();
            self.policy.refresh_blacklist();
            self.policy.gc();
        }
    }

    fn update_node_state(&self) {
        let (height, difficulty) = match self.cache.current() {
            Some(t) => (t.height, t.difficulty),
            None => (0, 0),
        };
        let state = NodeState { name: self.cfg.name.clone(), height, difficulty, ts: unix_now() };
        match self.storage.write_node_state(&state) {
            Ok(()) => self.health.reset(),
            Err(e) => {
                let fails = self.health.record_failure();
                tracing::error!("Node state write failed ({} fails): {}", fails, e);
            }
        }
    }
}

fn reply(code: i64, message: &str) -> Option<RpcError> {
    Some(RpcError { code, message: message.to_string() })
}

fn pending_height(pending: Option<&Value>) -> Option<u64> {
    let number = pending?.get("number")?.as_str()?;
    u64::from_str_radix(number.strip_prefix("0x")?, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scripted verifier: returns a fixed verdict and counts invocations.
    pub(crate) struct StubVerifier {
        pub verdict: Verdict,
        pub calls: Arc<AtomicUsize>,
    }

    impl StubVerifier {
        pub fn new(verdict: Verdict) -> Box<Self> {
            Box::new(Self { verdict, calls: Arc::new(AtomicUsize::new(0)) })
        }
    }

    impl ShareVerifier for StubVerifier {
        fn verify(&self, _: &Hash256, _: u64, _: &Hash256, _: &Hash256, _: &Hash256) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
    }

    fn test_config() -> Config {
        serde_json::from_str(
            r#"{
                "name": "test-proxy",
                "upstream": [ {"name": "main", "url": "http://127.0.0.1:1", "timeout_ms": 100} ]
            }"#,
        )
        .unwrap()
    }

    pub(crate) fn test_server(verdict: Verdict) -> Arc<ProxyServer> {
        test_server_with(test_config(), verdict)
    }

    pub(crate) fn test_server_with(cfg: Config, verdict: Verdict) -> Arc<ProxyServer> {
        let storage = Arc::new(Storage::temporary());
        let upstreams = Arc::new(UpstreamSet::new(&cfg.upstream).unwrap());
        ProxyServer::new(cfg, storage, upstreams, StubVerifier::new(verdict))
    }

    pub(crate) fn publish_test_template(server: &ProxyServer, header: &str, height: u64) {
        server.cache.publish(BlockTemplate {
            header: header.to_string(),
            seed: format!("0x{}", "22".repeat(32)),
            target: format!("0x{}", "00ff".repeat(16)),
            height,
            difficulty: 100,
            pending_block: Some(json!({"number": format!("{:#x}", height)})),
        });
    }

    fn origin() -> ShareOrigin {
        ShareOrigin {
            login: "0xabc0000000000000000000000000000000000001".into(),
            worker: "rig1".into(),
            ip: "10.1.1.1".into(),
            subscribed: true,
        }
    }

    fn submit_params(nonce: &str, header: &str) -> Value {
        json!([nonce, header, format!("0x{}", "33".repeat(32))])
    }

    fn test_header() -> String {
        format!("0x{}", "11".repeat(32))
    }

    #[tokio::test]
    async fn test_get_work_not_ready_then_round_trip() {
        let server = test_server(Verdict::Share);
        let resp = server.handle_get_work(json!(1));
        assert_eq!(resp.error.as_ref().unwrap().code, 0);
        assert_eq!(resp.error.as_ref().unwrap().message, "Work not ready");

        publish_test_template(&server, &test_header(), 7);
        let resp = server.handle_get_work(json!(2));
        assert!(resp.error.is_none());
        let work = resp.result.as_array().unwrap();
        assert_eq!(work[0], json!(test_header()));
        assert_eq!(work[2], json!(server.pool_target()));
    }

    #[tokio::test]
    async fn test_submit_not_subscribed() {
        let server = test_server(Verdict::Share);
        publish_test_template(&server, &test_header(), 7);
        let mut o = origin();
        o.subscribed = false;
        let resp = server
            .handle_submit_work(&o, json!(1), &submit_params("0x00000000deadbeef", &test_header()))
            .await;
        assert_eq!(resp.error.unwrap().code, 25);
    }

    #[tokio::test]
    async fn test_submit_wrong_param_count() {
        let server = test_server(Verdict::Share);
        let resp = server.handle_submit_work(&origin(), json!(1), &json!(["0x00"])).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "Invalid params");
    }

    #[tokio::test]
    async fn test_submit_malformed_shapes() {
        let server = test_server(Verdict::Share);
        let resp = server
            .handle_submit_work(&origin(), json!(1), &json!(["0xDEADBEEF", "0x00", "0x00"]))
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "Malformed PoW result");
    }

    #[tokio::test]
    async fn test_submit_accepts_then_rejects_duplicate() {
        let server = test_server(Verdict::Share);
        publish_test_template(&server, &test_header(), 7);
        let params = submit_params("0x00000000deadbeef", &test_header());

        let first = server.handle_submit_work(&origin(), json!(1), &params).await;
        assert!(first.error.is_none());
        assert_eq!(first.result, json!(true));

        let second = server.handle_submit_work(&origin(), json!(2), &params).await;
        let err = second.error.unwrap();
        assert_eq!(err.code, 22);
        assert_eq!(err.message, "Duplicate share");
    }

    #[tokio::test]
    async fn test_duplicate_never_reaches_verifier() {
        let cfg = test_config();
        let storage = Arc::new(Storage::temporary());
        let upstreams = Arc::new(UpstreamSet::new(&cfg.upstream).unwrap());
        let verifier = StubVerifier::new(Verdict::Share);
        let calls = verifier.calls.clone();
        let server = ProxyServer::new(cfg, storage, upstreams, verifier);
        publish_test_template(&server, &test_header(), 7);
        let params = submit_params("0x00000000deadbeef", &test_header());

        server.handle_submit_work(&origin(), json!(1), &params).await;
        server.handle_submit_work(&origin(), json!(2), &params).await;
        // One verification for two submissions of the same triple.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_share_is_silently_dropped_within_tolerance() {
        let server = test_server(Verdict::Invalid);
        publish_test_template(&server, &test_header(), 7);
        let resp = server
            .handle_submit_work(&origin(), json!(1), &submit_params("0x00000000deadbeef", &test_header()))
            .await;
        assert!(resp.error.is_none());
        assert_eq!(resp.result, json!(false));
    }

    #[tokio::test]
    async fn test_stale_header_not_accepted() {
        let server = test_server(Verdict::Share);
        publish_test_template(&server, &test_header(), 7);
        let unknown = format!("0x{}", "99".repeat(32));
        let resp = server
            .handle_submit_work(&origin(), json!(1), &submit_params("0x00000000deadbeef", &unknown))
            .await;
        assert!(resp.error.is_none());
        assert_eq!(resp.result, json!(false));
    }

    #[tokio::test]
    async fn test_valid_share_recorded_in_storage() {
        let server = test_server(Verdict::Share);
        publish_test_template(&server, &test_header(), 7);
        server
            .handle_submit_work(&origin(), json!(1), &submit_params("0x00000000deadbeef", &test_header()))
            .await;
        let shares = server.storage.shares_from(0).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].login, origin().login);
        assert_eq!(shares[0].height, 7);
        assert!(!shares[0].is_block);
    }

    #[tokio::test]
    async fn test_block_solution_recorded() {
        let server = test_server(Verdict::Block);
        publish_test_template(&server, &test_header(), 7);
        let resp = server
            .handle_submit_work(&origin(), json!(1), &submit_params("0x00000000deadbeef", &test_header()))
            .await;
        assert_eq!(resp.result, json!(true));
        let shares = server.storage.shares_from(0).unwrap();
        assert!(shares[0].is_block);
    }

    #[tokio::test]
    async fn test_pending_block_passthrough() {
        let server = test_server(Verdict::Share);
        let resp = server.handle_get_block_by_number(json!(1));
        assert_eq!(resp.result, Value::Null);

        publish_test_template(&server, &test_header(), 16);
        let resp = server.handle_get_block_by_number(json!(2));
        assert_eq!(resp.result, json!({"number": "0x10"}));
    }

    #[tokio::test]
    async fn test_sick_gates_broadcast_but_not_getwork() {
        let server = test_server(Verdict::Share);
        publish_test_template(&server, &test_header(), 7);
        for _ in 0..server.cfg.proxy.max_fails {
            server.health.record_failure();
        }
        assert!(server.is_sick());
        // Broadcast is a no-op while sick; getWork still serves.
        server.broadcast_job().await;
        assert!(server.handle_get_work(json!(1)).error.is_none());
    }

    #[test]
    fn test_pending_height_parsing() {
        assert_eq!(pending_height(Some(&json!({"number": "0x10"}))), Some(16));
        assert_eq!(pending_height(Some(&json!({"number": 16}))), None);
        assert_eq!(pending_height(None), None);
    }
}
