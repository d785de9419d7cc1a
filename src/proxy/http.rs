//! HTTP getwork transport.
//!
//! Miners POST a stream of JSON-RPC objects to `/{login}` or
//! `/{login}/{worker}`; the reply carries one JSON object per request. The
//! login comes from the URL, so the share pipeline's subscription check does
//! not apply here.

use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::pow;
use crate::rpc::{self, MinerRequest, RpcResponse};

use super::{ProxyServer, ShareOrigin};

/// Most of an oversize body is skipped, not read; this bounds the skip.
const DRAIN_LIMIT: usize = 256 * 1024;

/// Bind the configured HTTP endpoint and serve forever.
pub async fn run_http(server: Arc<ProxyServer>) -> Result<(), String> {
    let addr = server.cfg.proxy.listen.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("http bind {}: {}", addr, e))?;
    tracing::info!("🌐 HTTP getwork listening on {}", addr);
    serve(server, listener).await;
    Ok(())
}

pub async fn serve(server: Arc<ProxyServer>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let server = server.clone();
                let ip = peer.ip().to_string();
                tokio::spawn(async move {
                    handle_connection(server, stream, ip).await;
                });
            }
            Err(e) => tracing::error!("HTTP accept error: {}", e),
        }
    }
}

async fn handle_connection(server: Arc<ProxyServer>, mut stream: TcpStream, peer_ip: String) {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    match reader.read_line(&mut request_line).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");

    let header_limit = server.cfg.proxy.limit_headers_size;
    let mut header_bytes = 0usize;
    let mut content_length = 0usize;
    let mut forwarded_for: Option<String> = None;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(n) => header_bytes += n,
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if header_bytes > header_limit {
            respond(&mut writer, 431, "Request Header Fields Too Large", "").await;
            return;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            match name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "x-forwarded-for" => {
                    forwarded_for =
                        value.split(',').next().map(|ip| ip.trim().to_string()).filter(|ip| !ip.is_empty());
                }
                _ => {}
            }
        }
    }

    if method != "POST" {
        respond(&mut writer, 405, "Method Not Allowed", "").await;
        return;
    }

    let ip = if server.cfg.proxy.behind_reverse_proxy {
        forwarded_for.unwrap_or(peer_ip)
    } else {
        peer_ip
    };
    if server.policy.is_banned(&ip) {
        respond(&mut writer, 403, "Forbidden", "").await;
        return;
    }

    let Some((login, worker)) = parse_path(path) else {
        respond(&mut writer, 404, "Not Found", "").await;
        return;
    };
    if !server.policy.apply_login_policy(&login, &ip) {
        let reply = rpc::failure(Value::Null, -1, "You are blacklisted");
        respond(&mut writer, 200, "OK", &encode(&reply)).await;
        return;
    }

    if content_length > server.cfg.proxy.limit_body_size {
        server.policy.apply_malformed_policy(&ip);
        respond(&mut writer, 417, "Expectation Failed", "").await;
        // Drain a bounded slice of the refused body; closing on unread data
        // resets the connection under the peer's reply.
        let mut remaining = content_length.min(DRAIN_LIMIT);
        let mut sink = [0u8; 4096];
        while remaining > 0 {
            match reader.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(n) => remaining = remaining.saturating_sub(n),
            }
        }
        return;
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 && reader.read_exact(&mut body).await.is_err() {
        return;
    }

    let origin = ShareOrigin { login, worker, ip, subscribed: true };
    let mut replies = String::new();
    let mut decoded_any = false;
    for item in serde_json::Deserializer::from_slice(&body).into_iter::<MinerRequest>() {
        match item {
            Ok(request) => {
                decoded_any = true;
                let reply = dispatch(&server, &origin, request).await;
                replies.push_str(&encode(&reply));
                replies.push('\n');
            }
            Err(e) => {
                tracing::debug!("Bad JSON from {}: {}", origin.ip, e);
                server.policy.apply_malformed_policy(&origin.ip);
                if !decoded_any {
                    respond(&mut writer, 400, "Bad Request", "").await;
                    return;
                }
                break;
            }
        }
    }
    respond(&mut writer, 200, "OK", &replies).await;
}

async fn dispatch(server: &Arc<ProxyServer>, origin: &ShareOrigin, request: MinerRequest) -> RpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "eth_getWork" => server.handle_get_work(id),
        "eth_submitWork" => server.handle_submit_work(origin, id, &request.params).await,
        "eth_submitHashrate" => server.handle_submit_hashrate(id),
        "eth_getBlockByNumber" => server.handle_get_block_by_number(id),
        // eth_submitLogin included: identity comes from the URL here.
        _ => rpc::failure(id, -3, "Method not found"),
    }
}

/// `/{0x + 40 hex}` or `/{0x + 40 hex}/{1-8 worker chars}`.
fn parse_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    let mut segments = trimmed.split('/');
    let login = segments.next()?;
    if !pow::valid_login(login) {
        return None;
    }
    let worker = match segments.next() {
        Some(worker) => {
            if segments.next().is_some() {
                return None;
            }
            pow::sanitize_worker(worker)
        }
        None => "0".to_string(),
    };
    Some((login.to_lowercase(), worker))
}

fn encode(response: &RpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_default()
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, status: u16, reason: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    let _ = writer.write_all(response.as_bytes()).await;
}
