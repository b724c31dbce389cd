//! Typed error taxonomy and the RPC error classifier.
//!
//! Node vendors disagree wildly on how they phrase "that method does not
//! exist" and "your transaction reverted". The classifier keeps those
//! phrasings as ordinary data tables and maps every raw failure into one
//! closed [`EngineError`] taxonomy.

use alloy::primitives::Bytes;
use serde_json::Value;

use crate::transport::RpcFailure;

/// Closed error taxonomy for the engine.
///
/// `ApiNotImplemented` is the only recoverable variant: strategy-selection
/// code (trace backend discovery, creation-lookup fast path) catches it and
/// falls back to the next strategy. Every other variant propagates to the
/// caller unmodified.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No transport could be opened, or the transport died mid-session.
    #[error("unable to connect to node: {0}")]
    Connection(String),

    /// Generic RPC-level failure the taxonomy has no better name for.
    #[error("node returned an error (code {code}): {message}")]
    Provider {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The node reported the method as unknown or unsupported.
    #[error("the node does not implement {0}")]
    ApiNotImplemented(String),

    /// A block lookup came back empty.
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// A transaction lookup came back empty, including confirmation timeout.
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    /// Execution ran out of gas.
    #[error("transaction ran out of gas")]
    OutOfGas,

    /// Execution reverted, optionally with a decoded reason string.
    #[error("contract logic error: {reason}")]
    ContractLogic {
        reason: String,
        data: Option<Bytes>,
    },

    /// Catch-all EVM-level failure (bad opcode, stack fault, bad jump).
    #[error("virtual machine error: {0}")]
    VirtualMachine(String),

    /// Pipeline-level failure: bad confirmations count, chain-id mismatch,
    /// nonce or balance problems reported at submission time.
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl EngineError {
    /// True when a strategy-selection layer may fall back instead of failing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::ApiNotImplemented(_))
    }
}

/// Phrasings nodes use for "method not implemented", across vendors.
/// Checked case-insensitively against the error message.
const NOT_IMPLEMENTED_PHRASES: &[&str] = &[
    "method not found",
    "method not supported",
    "unsupported method",
    "does not exist/is not available",
    "not implemented",
    "unknown method",
    "is not available",
];

/// Phrasings that indicate gas exhaustion rather than a logic revert.
const OUT_OF_GAS_PHRASES: &[&str] = &[
    "out of gas",
    "gas required exceeds allowance",
    "intrinsic gas too low",
];

/// Phrasings for EVM-level faults that are not reverts.
const VM_FAULT_PHRASES: &[&str] = &[
    "invalid opcode",
    "stack underflow",
    "stack overflow",
    "invalid jump",
    "bad instruction",
];

/// Phrasings for submission-time logic problems the node rejects outright.
const SUBMISSION_PHRASES: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "insufficient funds",
    "replacement transaction underpriced",
    "already known",
];

/// JSON-RPC standard code for an unknown method.
const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// `Error(string)` ABI selector.
const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// `Panic(uint256)` ABI selector.
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Map a raw transport/RPC failure for `method` into the typed taxonomy.
pub fn classify(method: &str, failure: RpcFailure) -> EngineError {
    match failure {
        RpcFailure::Transport(message) => EngineError::Connection(message),
        RpcFailure::Rpc {
            code,
            message,
            data,
        } => classify_rpc_error(method, code, message, data),
    }
}

fn classify_rpc_error(
    method: &str,
    code: i64,
    message: String,
    data: Option<Value>,
) -> EngineError {
    let lower = message.to_lowercase();

    if code == METHOD_NOT_FOUND_CODE
        || NOT_IMPLEMENTED_PHRASES.iter().any(|p| lower.contains(p))
    {
        return EngineError::ApiNotImplemented(method.to_string());
    }
    if OUT_OF_GAS_PHRASES.iter().any(|p| lower.contains(p)) {
        return EngineError::OutOfGas;
    }
    if lower.contains("revert") {
        let (reason, raw) = decode_revert(&message, data.as_ref());
        return EngineError::ContractLogic { reason, data: raw };
    }
    if VM_FAULT_PHRASES.iter().any(|p| lower.contains(p)) {
        return EngineError::VirtualMachine(message);
    }
    if SUBMISSION_PHRASES.iter().any(|p| lower.contains(p)) {
        return EngineError::Transaction(message);
    }

    EngineError::Provider {
        code,
        message,
        data,
    }
}

/// Pull a revert reason out of the error message and/or the returned data.
///
/// Prefers an ABI-decoded `Error(string)` payload; falls back to whatever
/// the node put after "execution reverted:" in the message text.
fn decode_revert(message: &str, data: Option<&Value>) -> (String, Option<Bytes>) {
    let raw = data.and_then(extract_hex_payload);

    if let Some(bytes) = &raw {
        if let Some(reason) = decode_error_string(bytes) {
            return (reason, raw);
        }
        if let Some(code) = decode_panic_code(bytes) {
            return (format!("panic code 0x{code:x}"), raw);
        }
    }

    // Fall back to the message text, stripping the vendor prefix.
    let reason = message
        .split_once("execution reverted")
        .map(|(_, rest)| rest.trim_start_matches([':', ' ']))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(message)
        .to_string();

    (reason, raw)
}

/// Find a `0x`-prefixed hex blob inside an error `data` field.
///
/// Geth nests it as a bare string, others as `{"data": "0x..."}` or keyed
/// by transaction hash.
fn extract_hex_payload(data: &Value) -> Option<Bytes> {
    match data {
        Value::String(s) if s.starts_with("0x") => s.parse::<Bytes>().ok(),
        Value::Object(map) => map.values().find_map(extract_hex_payload),
        _ => None,
    }
}

/// ABI-decode an `Error(string)` revert payload.
fn decode_error_string(bytes: &Bytes) -> Option<String> {
    if bytes.len() < 68 || bytes[..4] != ERROR_SELECTOR {
        return None;
    }
    let len = usize_from_word(&bytes[36..68])?;
    let start: usize = 68;
    let end = start.checked_add(len)?;
    if end > bytes.len() {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes[start..end]).into_owned())
}

/// ABI-decode a `Panic(uint256)` payload into its panic code.
fn decode_panic_code(bytes: &Bytes) -> Option<u64> {
    if bytes.len() < 36 || bytes[..4] != PANIC_SELECTOR {
        return None;
    }
    usize_from_word(&bytes[4..36]).map(|v| v as u64)
}

/// Read a 32-byte big-endian ABI word that must fit in usize.
fn usize_from_word(word: &[u8]) -> Option<usize> {
    if word.len() != 32 || word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Some(u64::from_be_bytes(buf) as usize)
}
