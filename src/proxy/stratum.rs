//! Stratum transport: line-delimited JSON-RPC over raw TCP.
//!
//! One task per accepted connection, bounded by the `max_conn` semaphore.
//! Frames are single lines of at most [`MAX_LINE`] bytes; a longer line is a
//! flood and bans the source. Each session's writer is behind a mutex, so
//! responses and broadcast pushes never interleave on the wire.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::pow;
use crate::rpc::{self, MinerRequest, RpcResponse};

use super::{ProxyServer, ShareOrigin};

/// Maximum stratum frame length, newline excluded.
pub const MAX_LINE: usize = 1024;

const REAP_INTERVAL: Duration = Duration::from_secs(60);

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// One connected miner.
pub struct Session {
    pub id: u64,
    pub ip: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    login: parking_lot::RwLock<Option<String>>,
    worker: parking_lot::RwLock<String>,
    last_activity: AtomicU64,
}

impl Session {
    fn new(id: u64, ip: String, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            ip,
            writer: tokio::sync::Mutex::new(writer),
            login: parking_lot::RwLock::new(None),
            worker: parking_lot::RwLock::new("0".to_string()),
            last_activity: AtomicU64::new(unix_now()),
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(unix_now(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self) -> u64 {
        unix_now().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    pub fn login(&self) -> Option<String> {
        self.login.read().clone()
    }

    /// The login binds once; later submitLogin calls keep the first one.
    pub fn set_login(&self, login: String) -> bool {
        let mut slot = self.login.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(login);
        true
    }

    pub fn worker(&self) -> String {
        self.worker.read().clone()
    }

    pub fn set_worker(&self, worker: String) {
        *self.worker.write() = worker;
    }

    /// Serialized frame write; the mutex is the per-session ordering point.
    pub async fn write_frame(&self, response: &RpcResponse) -> Result<(), String> {
        let mut data = serde_json::to_vec(response).map_err(|e| format!("encode: {}", e))?;
        data.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await.map_err(|e| format!("write: {}", e))
    }

    /// New-work push. Success counts as activity so the reaper leaves the
    /// session alone for another full window.
    pub async fn push_work(&self, work: &[String; 3]) -> Result<(), String> {
        self.write_frame(&rpc::job_push(work)).await?;
        self.touch();
        Ok(())
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Bind the configured stratum endpoint and serve forever.
pub async fn run_stratum(server: Arc<ProxyServer>) -> Result<(), String> {
    let addr = server.cfg.proxy.stratum.listen.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("stratum bind {}: {}", addr, e))?;
    tracing::info!("⛏️  Stratum listening on {}", addr);
    tokio::spawn(run_reaper(server.clone()));
    serve(server, listener).await;
    Ok(())
}

/// Accept loop. The semaphore permit is taken before `accept`, so when
/// `max_conn` handlers are in flight new connections queue in the backlog
/// instead of being dropped.
pub async fn serve(server: Arc<ProxyServer>, listener: TcpListener) {
    let limiter = Arc::new(Semaphore::new(server.cfg.proxy.stratum.max_conn));
    loop {
        let Ok(permit) = limiter.clone().acquire_owned().await else {
            break;
        };
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ip = peer.ip().to_string();
                if server.policy.is_banned(&ip) {
                    tracing::debug!("🚫 Rejected banned miner {}", ip);
                    continue;
                }
                if !server.policy.apply_limit_policy(&ip) {
                    continue;
                }
                let server = server.clone();
                tokio::spawn(async move {
                    handle_session(server, stream, ip).await;
                    drop(permit);
                });
            }
            Err(e) => tracing::error!("Stratum accept error: {}", e),
        }
    }
}

async fn handle_session(server: Arc<ProxyServer>, stream: TcpStream, ip: String) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let session = Arc::new(Session::new(server.next_session_id(), ip.clone(), write_half));
    server.register_session(session.clone()).await;
    tracing::debug!("🔗 Miner connected from {} (session {})", ip, session.id);

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(MAX_LINE);
    loop {
        let deadline = server.read_deadline().await;
        match tokio::time::timeout(deadline, read_frame(&mut reader, &mut buf)).await {
            Err(_) => {
                // A broadcast push counts as activity and re-arms the deadline.
                if Duration::from_secs(session.idle_secs()) < deadline {
                    continue;
                }
                tracing::debug!("Session {} read deadline expired", session.id);
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!("Session {} read error: {}", session.id, e);
                break;
            }
            Ok(Ok(Frame::Eof)) => break,
            Ok(Ok(Frame::Oversize)) => {
                server.policy.apply_malformed_policy(&ip);
                server.policy.ban(&ip, "oversize stratum frame");
                break;
            }
            Ok(Ok(Frame::Line)) => {
                let frame = std::mem::take(&mut buf);
                // Bare keepalive newlines are tolerated.
                if frame.is_empty() {
                    continue;
                }
                session.touch();
                let request: MinerRequest = match serde_json::from_slice(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::debug!("Session {} sent bad JSON: {}", session.id, e);
                        server.policy.apply_malformed_policy(&ip);
                        break;
                    }
                };
                let response = dispatch(&server, &session, request).await;
                if session.write_frame(&response).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
    server.remove_session(session.id).await;
    tracing::debug!("🔌 Session {} ({}) closed", session.id, ip);
}

enum Frame {
    Line,
    Eof,
    Oversize,
}

/// Read one newline-terminated frame, never buffering more than
/// `MAX_LINE + 1` bytes of a single line.
///
/// `buf` accumulates across calls: a read cancelled by the deadline leaves
/// its partial line in place and the next call continues it. The caller
/// takes the buffer once `Frame::Line` is returned.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = (MAX_LINE + 1).saturating_sub(buf.len()).max(1);
    let n = {
        let mut limited = (&mut *reader).take(remaining as u64);
        limited.read_until(b'\n', buf).await?
    };
    if n == 0 && buf.is_empty() {
        return Ok(Frame::Eof);
    }
    if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE {
        return Ok(Frame::Oversize);
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    // No newline with bytes left over means the peer hit EOF mid-line;
    // serve it as the final frame.
    Ok(Frame::Line)
}

async fn dispatch(server: &Arc<ProxyServer>, session: &Arc<Session>, request: MinerRequest) -> RpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "eth_submitLogin" => handle_login(server, session, request),
        "eth_getWork" => server.handle_get_work(id),
        "eth_submitWork" => {
            let origin = ShareOrigin {
                login: session.login().unwrap_or_default(),
                worker: request
                    .worker
                    .as_deref()
                    .map(pow::sanitize_worker)
                    .unwrap_or_else(|| session.worker()),
                ip: session.ip.clone(),
                subscribed: session.login().is_some(),
            };
            server.handle_submit_work(&origin, id, &request.params).await
        }
        "eth_submitHashrate" => server.handle_submit_hashrate(id),
        "mining.ping" => handle_ping(id, &request.params),
        _ => rpc::failure(id, -3, "Method not found"),
    }
}

fn handle_login(server: &Arc<ProxyServer>, session: &Arc<Session>, request: MinerRequest) -> RpcResponse {
    let id = request.id;
    let login = match request.params.get(0).and_then(|v| v.as_str()) {
        Some(login) if pow::valid_login(login) => login.to_lowercase(),
        _ => return rpc::failure(id, -1, "Invalid login"),
    };
    if !server.policy.apply_login_policy(&login, &session.ip) {
        return rpc::failure(id, -1, "You are blacklisted");
    }
    if session.set_login(login.clone()) {
        tracing::info!("⛏️  Miner {} logged in from {}", login, session.ip);
    }
    if let Some(worker) = request.worker.as_deref() {
        session.set_worker(pow::sanitize_worker(worker));
    }
    rpc::success(id, json!(true))
}

fn handle_ping(id: Value, params: &Value) -> RpcResponse {
    match params.get(0).and_then(|v| v.as_str()) {
        Some(token) => rpc::success(id, json!({"pong": token})),
        None => rpc::failure(id, -1, "Invalid ping"),
    }
}

pub async fn run_reaper(server: Arc<ProxyServer>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let reaped = server.reap_idle().await;
        if reaped > 0 {
            tracing::info!("⏱️  Reaped {} idle sessions", reaped);
        }
    }
}
