//! Raw opcode-level trace frames.

use alloy::primitives::Address;
use serde::Deserialize;

/// One opcode-level execution step from a struct-log trace.
///
/// Produced only as raw backend output and never mutated; the call-tree
/// builder consumes frames in execution order.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TraceFrame {
    /// Program counter.
    pub pc: u64,
    /// Opcode mnemonic.
    pub op: String,
    /// Gas remaining before this step.
    pub gas: u64,
    /// Gas consumed by this step.
    #[serde(rename = "gasCost", default)]
    pub gas_cost: u64,
    /// Call depth; the root call executes at depth 1.
    pub depth: u64,
    /// EVM stack as hex words, top last. Present only when the backend
    /// was asked for it; needed to resolve call targets.
    #[serde(default)]
    pub stack: Vec<String>,
    /// Executing contract, when the backend includes it.
    #[serde(default)]
    pub address: Option<Address>,
}

impl TraceFrame {
    /// Call target for a `CALL`-family opcode, read from the stack.
    ///
    /// The address is the second word from the top. Absent or short
    /// stacks yield `None`; `CREATE`/`CREATE2` targets are not on the
    /// stack at all.
    pub fn call_target(&self) -> Option<Address> {
        let word = self.stack.iter().rev().nth(1)?;
        let digits = word.strip_prefix("0x").unwrap_or(word);
        // Address is the low 20 bytes of the word.
        let trimmed = if digits.len() > 40 {
            &digits[digits.len() - 40..]
        } else {
            digits
        };
        format!("0x{trimmed:0>40}").parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_geth_struct_log_row() {
        let raw = json!({
            "pc": 2,
            "op": "CALL",
            "gas": 100000,
            "gasCost": 700,
            "depth": 1,
            "stack": ["0x0", "0x70997970c51812e339d9b73b0245ad59e15ebbf9", "0x186a0"],
        });
        let frame: TraceFrame = serde_json::from_value(raw).expect("valid frame");
        assert_eq!(frame.op, "CALL");
        assert_eq!(frame.depth, 1);
        assert_eq!(
            frame.call_target(),
            Some("0x70997970c51812e339d9b73b0245ad59e15ebbf9".parse().unwrap())
        );
    }

    #[test]
    fn missing_stack_yields_no_target() {
        let raw = json!({"pc": 0, "op": "PUSH1", "gas": 1, "gasCost": 3, "depth": 1});
        let frame: TraceFrame = serde_json::from_value(raw).expect("valid frame");
        assert_eq!(frame.call_target(), None);
    }

    #[test]
    fn full_word_target_takes_low_twenty_bytes() {
        let frame = TraceFrame {
            pc: 0,
            op: "CALL".to_string(),
            gas: 0,
            gas_cost: 0,
            depth: 1,
            stack: vec![
                "0x0".to_string(),
                format!("0x{}{}", "00".repeat(12), "70997970c51812e339d9b73b0245ad59e15ebbf9"),
                "0x0".to_string(),
            ],
            address: None,
        };
        assert_eq!(
            frame.call_target(),
            Some("0x70997970c51812e339d9b73b0245ad59e15ebbf9".parse().unwrap())
        );
    }
}
