//! Hex-quantity codecs for JSON-RPC parameters and results.
//!
//! All integer RPC parameters are minimal hex with a `0x` prefix. Parsing
//! accepts either hex-with-prefix or bare decimal, since test backends and
//! older nodes mix the two.

use alloy::primitives::{Address, B256, Bytes, U256};
use serde_json::Value;

use crate::errors::EngineError;

/// Encode a u64 as a `0x`-prefixed minimal hex quantity.
pub fn from_u64(value: u64) -> String {
    format!("0x{value:x}")
}

/// Encode a U256 as a `0x`-prefixed minimal hex quantity.
pub fn from_u256(value: U256) -> String {
    format!("0x{value:x}")
}

/// Encode a quantity, omitting exactly-zero values.
///
/// Some nodes mishandle explicit `0x0` fields in transaction objects, so
/// zero-valued fields are left out of the payload by convention.
pub fn nonzero(value: U256) -> Option<String> {
    (!value.is_zero()).then(|| from_u256(value))
}

fn bad_field(field: &str, value: &Value) -> EngineError {
    EngineError::Provider {
        code: 0,
        message: format!("malformed {field} in node response: {value}"),
        data: None,
    }
}

/// Parse a u64 quantity from a JSON value (hex string or number).
pub fn to_u64(value: &Value, field: &str) -> Result<u64, EngineError> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| bad_field(field, value)),
        Value::String(s) => {
            let digits = s.strip_prefix("0x").unwrap_or(s);
            let radix = if s.starts_with("0x") { 16 } else { 10 };
            u64::from_str_radix(digits, radix).map_err(|_| bad_field(field, value))
        }
        _ => Err(bad_field(field, value)),
    }
}

/// Parse a U256 quantity from a JSON value (hex string or number).
pub fn to_u256(value: &Value, field: &str) -> Result<U256, EngineError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| bad_field(field, value)),
        Value::String(s) => {
            let digits = s.strip_prefix("0x").unwrap_or(s);
            if s.starts_with("0x") {
                U256::from_str_radix(digits, 16).map_err(|_| bad_field(field, value))
            } else {
                U256::from_str_radix(digits, 10).map_err(|_| bad_field(field, value))
            }
        }
        _ => Err(bad_field(field, value)),
    }
}

/// Parse a u128 quantity from a JSON value (hex string or number).
///
/// Fee fields fit u128 on every sane chain; a wider value is a malformed
/// node response, not a wider fee.
pub fn to_u128(value: &Value, field: &str) -> Result<u128, EngineError> {
    let wide = to_u256(value, field)?;
    u128::try_from(wide).map_err(|_| bad_field(field, value))
}

/// Parse an address from a JSON hex string.
pub fn to_address(value: &Value, field: &str) -> Result<Address, EngineError> {
    value
        .as_str()
        .and_then(|s| s.parse::<Address>().ok())
        .ok_or_else(|| bad_field(field, value))
}

/// Parse a 32-byte hash from a JSON hex string.
pub fn to_b256(value: &Value, field: &str) -> Result<B256, EngineError> {
    value
        .as_str()
        .and_then(|s| s.parse::<B256>().ok())
        .ok_or_else(|| bad_field(field, value))
}

/// Parse a byte string from a JSON hex string. Missing/null means empty.
pub fn to_bytes(value: &Value, field: &str) -> Result<Bytes, EngineError> {
    match value {
        Value::Null => Ok(Bytes::new()),
        Value::String(s) => s.parse::<Bytes>().map_err(|_| bad_field(field, value)),
        _ => Err(bad_field(field, value)),
    }
}
