//! JSON-RPC transports.
//!
//! [`Transport`] is the capability seam between the connection layer and
//! the wire: one implementation per provider variant (HTTP node, IPC node,
//! in-process mock). Requests are single round trips; `request_stream`
//! additionally supports incremental parsing of one large array inside the
//! response so callers see items before the payload finishes downloading.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};

/// Raw failure from a transport, before classification.
#[derive(Debug, Clone)]
pub enum RpcFailure {
    /// The wire itself failed (unreachable, closed, garbled framing).
    Transport(String),
    /// The node answered with a JSON-RPC error object.
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

/// Channel capacity for streamed array items.
const STREAM_BUFFER: usize = 64;

/// One JSON-RPC wire. Implementations must be shareable across tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request and return the `result` field.
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure>;

    /// Issue one request whose result contains a large array at
    /// `item_path` (dotted, rooted at the response envelope, e.g.
    /// `"result.structLogs"`); items are delivered one by one.
    async fn request_stream(
        &self,
        method: &str,
        params: Value,
        item_path: &str,
    ) -> Result<mpsc::Receiver<Result<Value, RpcFailure>>, RpcFailure>;

    /// Human-readable endpoint description, for logging.
    fn endpoint(&self) -> String;
}

fn envelope(id: u64, method: &str, params: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Split a parsed response envelope into result or failure.
fn unwrap_envelope(mut response: Value) -> Result<Value, RpcFailure> {
    if let Some(error) = response.get_mut("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let data = error.get_mut("data").map(Value::take);
        return Err(RpcFailure::Rpc {
            code,
            message,
            data,
        });
    }
    match response.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcFailure::Transport(
            "response carried neither result nor error".to_string(),
        )),
    }
}

/// HTTP(S) JSON-RPC transport over a pooled reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
    url: reqwest::Url,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: &str) -> Result<Self, RpcFailure> {
        let url = url
            .parse::<reqwest::Url>()
            .map_err(|e| RpcFailure::Transport(format!("invalid RPC URL: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, method: &str, params: &Value) -> Result<reqwest::Response, RpcFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.client
            .post(self.url.clone())
            .json(&envelope(id, method, params))
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(format!("{method} request failed: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let response = self.post(method, &params).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("{method} response unreadable: {e}")))?;
        unwrap_envelope(body)
    }

    async fn request_stream(
        &self,
        method: &str,
        params: Value,
        item_path: &str,
    ) -> Result<mpsc::Receiver<Result<Value, RpcFailure>>, RpcFailure> {
        let response = self.post(method, &params).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let method = method.to_string();
        let mut splitter = ArrayItemSplitter::new(item_path);

        // Reader task: feed body chunks through the splitter as they land.
        // Dropping the receiver cancels it through send failure. Until the
        // array opens the body is also buffered, so a node that answers
        // with an error envelope instead of the array still surfaces that
        // error rather than an empty stream.
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut items = Vec::new();
            let mut prefix = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(RpcFailure::Transport(format!(
                                "{method} stream interrupted: {e}"
                            ))))
                            .await;
                        return;
                    }
                };
                if !splitter.array_started() {
                    prefix.extend_from_slice(&chunk);
                }
                if let Err(e) = splitter.feed(&chunk, &mut items) {
                    let _ = tx
                        .send(Err(RpcFailure::Transport(format!(
                            "{method} stream item unparsable: {e}"
                        ))))
                        .await;
                    return;
                }
                for item in items.drain(..) {
                    if tx.send(Ok(item)).await.is_err() {
                        return;
                    }
                }
                if splitter.is_done() {
                    return;
                }
            }
            if !splitter.array_started() {
                let failure = match serde_json::from_slice::<Value>(&prefix) {
                    Ok(envelope) => match unwrap_envelope(envelope) {
                        Err(failure) => failure,
                        Ok(_) => RpcFailure::Transport(format!(
                            "{method} response has no streamable array"
                        )),
                    },
                    Err(e) => {
                        RpcFailure::Transport(format!("{method} response unreadable: {e}"))
                    }
                };
                let _ = tx.send(Err(failure)).await;
            }
        });

        Ok(rx)
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

/// Local-socket transport with newline-delimited JSON-RPC framing.
pub struct IpcTransport {
    path: PathBuf,
    stream: Mutex<BufReader<UnixStream>>,
    next_id: AtomicU64,
}

impl IpcTransport {
    pub async fn connect(path: PathBuf) -> Result<Self, RpcFailure> {
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| RpcFailure::Transport(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            stream: Mutex::new(BufReader::new(stream)),
            next_id: AtomicU64::new(1),
        })
    }

    async fn round_trip(&self, method: &str, params: &Value) -> Result<Value, RpcFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_vec(&envelope(id, method, params))
            .map_err(|e| RpcFailure::Transport(format!("cannot encode {method}: {e}")))?;
        payload.push(b'\n');

        // One request/response pair at a time on the socket.
        let mut guard = self.stream.lock().await;
        guard
            .get_mut()
            .write_all(&payload)
            .await
            .map_err(|e| RpcFailure::Transport(format!("{method} write failed: {e}")))?;

        let mut line = String::new();
        let read = guard
            .read_line(&mut line)
            .await
            .map_err(|e| RpcFailure::Transport(format!("{method} read failed: {e}")))?;
        if read == 0 {
            return Err(RpcFailure::Transport(format!(
                "node closed socket during {method}"
            )));
        }
        serde_json::from_str(&line)
            .map_err(|e| RpcFailure::Transport(format!("{method} response unreadable: {e}")))
    }
}

#[async_trait]
impl Transport for IpcTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        unwrap_envelope(self.round_trip(method, &params).await?)
    }

    async fn request_stream(
        &self,
        method: &str,
        params: Value,
        item_path: &str,
    ) -> Result<mpsc::Receiver<Result<Value, RpcFailure>>, RpcFailure> {
        // The socket delivers one framed line; split items from the parsed
        // envelope rather than re-tokenizing bytes.
        let response = self.round_trip(method, &params).await?;
        let items = navigate_array(&response, item_path)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for item in items {
                if tx.send(Ok(item)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}

/// Resolve a dotted path to an owned array inside a parsed envelope.
pub(crate) fn navigate_array(envelope: &Value, item_path: &str) -> Result<Vec<Value>, RpcFailure> {
    let mut cursor = envelope;
    for segment in item_path.split('.') {
        cursor = cursor.get(segment).ok_or_else(|| {
            RpcFailure::Transport(format!("response has no {item_path} array"))
        })?;
    }
    cursor
        .as_array()
        .cloned()
        .ok_or_else(|| RpcFailure::Transport(format!("{item_path} is not an array")))
}

/// Incremental splitter for one large JSON array inside a byte stream.
///
/// Seeks the quoted final path segment (e.g. `"structLogs"`), skips to the
/// opening bracket, then emits each top-level array element as soon as its
/// closing byte arrives. String contents and escapes are tracked so
/// brackets inside strings never confuse the depth count.
pub struct ArrayItemSplitter {
    needle: Vec<u8>,
    matched: usize,
    phase: Phase,
    in_string: bool,
    escaped: bool,
}

enum Phase {
    Seeking,
    AwaitBracket,
    InArray { depth: usize, item: Vec<u8> },
    Done,
}

impl ArrayItemSplitter {
    pub fn new(item_path: &str) -> Self {
        let last = item_path.rsplit('.').next().unwrap_or(item_path);
        Self {
            needle: format!("\"{last}\"").into_bytes(),
            matched: 0,
            phase: Phase::Seeking,
            in_string: false,
            escaped: false,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    /// Whether the target array's opening bracket has been consumed.
    pub fn array_started(&self) -> bool {
        matches!(self.phase, Phase::InArray { .. } | Phase::Done)
    }

    /// Consume one chunk, appending every completed array element to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Value>) -> Result<(), serde_json::Error> {
        for &byte in chunk {
            match &mut self.phase {
                Phase::Seeking => {
                    if byte == self.needle[self.matched] {
                        self.matched += 1;
                        if self.matched == self.needle.len() {
                            self.phase = Phase::AwaitBracket;
                        }
                    } else {
                        self.matched = usize::from(byte == self.needle[0]);
                    }
                }
                Phase::AwaitBracket => match byte {
                    b'[' => {
                        self.phase = Phase::InArray {
                            depth: 1,
                            item: Vec::new(),
                        };
                    }
                    b':' | b' ' | b'\t' | b'\r' | b'\n' => {}
                    // The key matched inside some other value; keep seeking.
                    _ => {
                        self.matched = 0;
                        self.phase = Phase::Seeking;
                    }
                },
                Phase::InArray { depth, item } => {
                    if self.in_string {
                        item.push(byte);
                        if self.escaped {
                            self.escaped = false;
                        } else if byte == b'\\' {
                            self.escaped = true;
                        } else if byte == b'"' {
                            self.in_string = false;
                        }
                        continue;
                    }
                    match byte {
                        b'"' => {
                            self.in_string = true;
                            item.push(byte);
                        }
                        b'{' | b'[' => {
                            *depth += 1;
                            item.push(byte);
                        }
                        b'}' | b']' => {
                            *depth -= 1;
                            if *depth == 0 {
                                let pending = std::mem::take(item);
                                self.phase = Phase::Done;
                                push_item(&pending, out)?;
                            } else {
                                item.push(byte);
                            }
                        }
                        b',' if *depth == 1 => {
                            let pending = std::mem::take(item);
                            push_item(&pending, out)?;
                        }
                        _ => item.push(byte),
                    }
                }
                Phase::Done => return Ok(()),
            }
        }
        Ok(())
    }
}

fn push_item(raw: &[u8], out: &mut Vec<Value>) -> Result<(), serde_json::Error> {
    let trimmed = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &raw[start..])
        .unwrap_or(&[]);
    if trimmed.is_empty() {
        return Ok(());
    }
    out.push(serde_json::from_slice(trimmed)?);
    Ok(())
}
