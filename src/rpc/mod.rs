//! JSON-RPC plumbing: the wire types shared by the stratum and HTTP miner
//! transports, and the client side used against upstream nodes.
//!
//! The upstream client speaks JSON-RPC over plain HTTP/1.1 on a Tokio TCP
//! stream with `Connection: close`, one roundtrip per call, bounded by the
//! upstream's configured timeout.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ─── Miner-facing wire types ────────────────────────────────────────

/// One request frame from a miner, over either transport.
#[derive(Debug, Clone, Deserialize)]
pub struct MinerRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Worker tag some mining clients attach next to the params.
    #[serde(default)]
    pub worker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

pub fn success(id: Value, result: Value) -> RpcResponse {
    RpcResponse { jsonrpc: "2.0", id, result, error: None }
}

pub fn failure(id: Value, code: i64, message: &str) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Value::Null,
        error: Some(RpcError { code, message: message.to_string() }),
    }
}

/// Unsolicited new-work push: `{"jsonrpc":"2.0","id":0,"result":[h,s,t]}`.
pub fn job_push(work: &[String; 3]) -> RpcResponse {
    success(json!(0), json!(work))
}

// ─── Upstream client ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GetWorkReply {
    pub header: String,
    pub seed: String,
    pub target: String,
    /// Some nodes append the block number as a fourth element.
    pub height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UpstreamReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

/// JSON-RPC client for a single upstream node.
#[derive(Debug, Clone)]
pub struct NodeClient {
    pub name: String,
    host: String,
    port: u16,
    path: String,
    timeout: Duration,
}

impl NodeClient {
    pub fn new(name: &str, url: &str, timeout: Duration) -> Result<Self, String> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| format!("upstream {}: only http:// urls are supported", name))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p.parse().map_err(|_| format!("upstream {}: bad port {}", name, p))?;
                (h.to_string(), port)
            }
            None => (authority.to_string(), 80),
        };
        if host.is_empty() {
            return Err(format!("upstream {}: empty host in {}", name, url));
        }
        Ok(Self { name: name.to_string(), host, port, path, timeout })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        let body = json!({"jsonrpc": "2.0", "id": 0, "method": method, "params": params}).to_string();
        let fut = self.roundtrip(body);
        let raw = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| format!("{}: timeout after {:?}", self.name, self.timeout))??;

        let reply: UpstreamReply =
            serde_json::from_str(&raw).map_err(|e| format!("{}: bad reply: {}", self.name, e))?;
        if let Some(err) = reply.error {
            return Err(format!("{}: rpc error {}: {}", self.name, err.code, err.message));
        }
        Ok(reply.result)
    }

    async fn roundtrip(&self, body: String) -> Result<String, String> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| format!("{}: connect: {}", self.name, e))?;
        let _ = stream.set_nodelay(true);

        let request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.path, self.host, body.len(), body
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| format!("{}: write: {}", self.name, e))?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(|e| format!("{}: read: {}", self.name, e))?;

        let text = String::from_utf8_lossy(&response);
        let body_start = text
            .find("\r\n\r\n")
            .ok_or_else(|| format!("{}: malformed http response", self.name))?;
        Ok(text[body_start + 4..].to_string())
    }

    /// `eth_getWork` → `[header, seed, target, height?]`.
    pub async fn get_work(&self) -> Result<GetWorkReply, String> {
        let result = self.call("eth_getWork", json!([])).await?;
        let items = result
            .as_array()
            .ok_or_else(|| format!("{}: eth_getWork: not an array", self.name))?;
        if items.len() < 3 {
            return Err(format!("{}: eth_getWork: {} elements", self.name, items.len()));
        }
        let field = |i: usize| -> Result<String, String> {
            items[i]
                .as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| format!("{}: eth_getWork[{}]: not a string", self.name, i))
        };
        let height = items.get(3).and_then(|v| v.as_str()).and_then(parse_hex_u64);
        Ok(GetWorkReply { header: field(0)?, seed: field(1)?, target: field(2)?, height })
    }

    /// `eth_submitWork` with a solved nonce. Returns the node's verdict.
    pub async fn submit_work(&self, nonce: &str, header: &str, mix: &str) -> Result<bool, String> {
        let result = self.call("eth_submitWork", json!([nonce, header, mix])).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// `eth_getBlockByNumber("pending", false)`, passed through opaquely.
    pub async fn get_pending_block(&self) -> Result<Value, String> {
        self.call("eth_getBlockByNumber", json!(["pending", false])).await
    }

    /// Liveness probe: a cheap `eth_blockNumber` roundtrip.
    pub async fn check(&self) -> Result<(), String> {
        self.call("eth_blockNumber", json!([])).await.map(|_| ())
    }
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_url_parsing() {
        let c = NodeClient::new("main", "http://127.0.0.1:8545", Duration::from_secs(1)).unwrap();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 8545);
        assert_eq!(c.path, "/");

        let c = NodeClient::new("alt", "http://node.local:8545/rpc", Duration::from_secs(1)).unwrap();
        assert_eq!(c.path, "/rpc");

        assert!(NodeClient::new("bad", "https://x:1", Duration::from_secs(1)).is_err());
        assert!(NodeClient::new("bad", "http://:8545", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_response_shapes() {
        let ok = success(json!(1), json!(true));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"jsonrpc":"2.0","id":1,"result":true}"#
        );

        let err = failure(json!(7), 22, "Duplicate share");
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains(r#""error":{"code":22,"message":"Duplicate share"}"#));
        assert!(text.contains(r#""result":null"#));

        let push = job_push(&["0xaa".into(), "0xbb".into(), "0xcc".into()]);
        assert_eq!(
            serde_json::to_string(&push).unwrap(),
            r#"{"jsonrpc":"2.0","id":0,"result":["0xaa","0xbb","0xcc"]}"#
        );
    }

    #[test]
    fn test_miner_request_decoding() {
        let req: MinerRequest = serde_json::from_str(
            r#"{"id":1,"method":"eth_submitLogin","params":["0xabc"],"worker":"rig1"}"#,
        )
        .unwrap();
        assert_eq!(req.method, "eth_submitLogin");
        assert_eq!(req.worker.as_deref(), Some("rig1"));

        // id and params are optional on the wire
        let req: MinerRequest = serde_json::from_str(r#"{"method":"eth_getWork"}"#).unwrap();
        assert!(req.id.is_null());
        assert!(req.params.is_null());
    }

    /// Answers exactly one HTTP POST with the given JSON body, then closes.
    async fn one_shot_server(reply: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(reader);
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    break;
                }
                if let Some(v) = trimmed
                    .strip_prefix("Content-Length:")
                    .or_else(|| trimmed.strip_prefix("content-length:"))
                {
                    content_length = v.trim().parse().unwrap();
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                reply.len(),
                reply
            );
            writer.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_get_work_roundtrip() {
        let addr = one_shot_server(
            r#"{"jsonrpc":"2.0","id":0,"result":["0xaa","0xbb","0xcc","0x10"]}"#,
        )
        .await;
        let client =
            NodeClient::new("test", &format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let work = client.get_work().await.unwrap();
        assert_eq!(work.header, "0xaa");
        assert_eq!(work.seed, "0xbb");
        assert_eq!(work.target, "0xcc");
        assert_eq!(work.height, Some(16));
    }

    #[tokio::test]
    async fn test_upstream_error_is_propagated() {
        let addr = one_shot_server(
            r#"{"jsonrpc":"2.0","id":0,"result":null,"error":{"code":-32000,"message":"no work"}}"#,
        )
        .await;
        let client =
            NodeClient::new("test", &format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let err = client.get_work().await.unwrap_err();
        assert!(err.contains("no work"), "{}", err);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        // Listener that accepts and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let client =
            NodeClient::new("slow", &format!("http://{}", addr), Duration::from_millis(100)).unwrap();
        let err = client.check().await.unwrap_err();
        assert!(err.contains("timeout"), "{}", err);
    }
}
