//! In-process test-backend transport.
//!
//! The mock is a first-class provider variant, not a test-only shim: a
//! scripted node that answers from per-method response queues. Unscripted
//! methods answer with the standard "method not found" error so
//! strategy-fallback paths behave exactly as they would against a node
//! missing that API.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::transport::{navigate_array, RpcFailure, Transport};

type Handler = Box<dyn Fn(&Value) -> Result<Value, RpcFailure> + Send + Sync>;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Result<Value, RpcFailure>>>,
    sticky: HashMap<String, Value>,
    handlers: HashMap<String, Handler>,
    calls: Vec<(String, Value)>,
}

/// Scripted JSON-RPC backend.
///
/// Clones share the same script and call log, so a test can keep a handle
/// for assertions after handing the transport to a connection.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot `result` for `method`. Queued responses are
    /// consumed in FIFO order before any sticky response.
    pub fn queue_response(&self, method: &str, result: Value) {
        let mut script = self.script.lock().unwrap();
        script
            .queued
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(result));
    }

    /// Queue a one-shot JSON-RPC error for `method`.
    pub fn queue_error(&self, method: &str, code: i64, message: &str) {
        self.queue_error_with_data(method, code, message, None);
    }

    /// Queue a one-shot JSON-RPC error carrying a `data` payload.
    pub fn queue_error_with_data(
        &self,
        method: &str,
        code: i64,
        message: &str,
        data: Option<Value>,
    ) {
        let mut script = self.script.lock().unwrap();
        script
            .queued
            .entry(method.to_string())
            .or_default()
            .push_back(Err(RpcFailure::Rpc {
                code,
                message: message.to_string(),
                data,
            }));
    }

    /// Set a sticky `result` that answers every remaining call to `method`.
    pub fn respond_with(&self, method: &str, result: Value) {
        let mut script = self.script.lock().unwrap();
        script.sticky.insert(method.to_string(), result);
    }

    /// Install a params-aware handler for `method`. Handlers answer after
    /// queued responses are exhausted and before sticky responses; use
    /// them to script stateful backends such as a growing chain.
    pub fn respond_using(
        &self,
        method: &str,
        handler: impl Fn(&Value) -> Result<Value, RpcFailure> + Send + Sync + 'static,
    ) {
        let mut script = self.script.lock().unwrap();
        script.handlers.insert(method.to_string(), Box::new(handler));
    }

    /// Number of requests seen for `method`.
    pub fn call_count(&self, method: &str) -> usize {
        let script = self.script.lock().unwrap();
        script.calls.iter().filter(|(m, _)| m == method).count()
    }

    /// Every `(method, params)` pair seen, in request order.
    pub fn recorded_calls(&self) -> Vec<(String, Value)> {
        self.script.lock().unwrap().calls.clone()
    }

    fn answer(&self, method: &str, params: &Value) -> Result<Value, RpcFailure> {
        let mut script = self.script.lock().unwrap();
        script.calls.push((method.to_string(), params.clone()));
        if let Some(queue) = script.queued.get_mut(method) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        if let Some(handler) = script.handlers.get(method) {
            return handler(params);
        }
        if let Some(result) = script.sticky.get(method) {
            return Ok(result.clone());
        }
        Err(RpcFailure::Rpc {
            code: -32601,
            message: format!("the method {method} does not exist/is not available"),
            data: None,
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        self.answer(method, &params)
    }

    async fn request_stream(
        &self,
        method: &str,
        params: Value,
        item_path: &str,
    ) -> Result<mpsc::Receiver<Result<Value, RpcFailure>>, RpcFailure> {
        // Scripted values are `result` payloads; drop the leading segment
        // that addresses the envelope.
        let result = self.answer(method, &params)?;
        let relative = item_path.strip_prefix("result.").unwrap_or(item_path);
        let items = navigate_array(&result, relative)?;
        let (tx, rx) = mpsc::channel(items.len().max(1));
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
        "mock://".to_string()
    }
}
