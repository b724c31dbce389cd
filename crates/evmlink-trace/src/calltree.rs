//! Normalized call trees and their builders.
//!
//! Three raw formats feed the same [`CallTreeNode`] shape: parity-style
//! flat traces, geth's call tracer, and opcode-level struct logs. Each
//! builder keeps the invariant that a node's `gas_cost` is its own
//! consumed gas only; subtree totals are computed on demand.

use std::collections::HashMap;

use alloy::primitives::{Address, Bytes, U256};
use serde_json::Value;

use evmlink_rpc::errors::EngineError;
use evmlink_rpc::quantity;

use crate::frame::TraceFrame;

/// Kind of call that opened a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallType {
    Call,
    DelegateCall,
    StaticCall,
    Create,
    Create2,
}

impl CallType {
    /// Map an opcode mnemonic from a struct log.
    pub fn from_opcode(op: &str) -> Option<Self> {
        match op {
            "CALL" | "CALLCODE" => Some(CallType::Call),
            "DELEGATECALL" => Some(CallType::DelegateCall),
            "STATICCALL" => Some(CallType::StaticCall),
            "CREATE" => Some(CallType::Create),
            "CREATE2" => Some(CallType::Create2),
            _ => None,
        }
    }

    /// Map a backend label (geth call tracer or parity `callType`).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "CALL" | "CALLCODE" => Some(CallType::Call),
            "DELEGATECALL" => Some(CallType::DelegateCall),
            "STATICCALL" => Some(CallType::StaticCall),
            "CREATE" => Some(CallType::Create),
            "CREATE2" => Some(CallType::Create2),
            _ => None,
        }
    }

    pub fn is_create(self) -> bool {
        matches!(self, CallType::Create | CallType::Create2)
    }
}

/// One node of the execution call tree. Children are owned exclusively by
/// their parent; the structure is always a tree, never a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct CallTreeNode {
    /// Target contract (deployed address for creations).
    pub address: Address,
    pub call_type: CallType,
    pub calldata: Bytes,
    pub return_data: Bytes,
    pub failed: bool,
    /// Gas consumed by this call itself, excluding children.
    pub gas_cost: u64,
    pub value: U256,
    pub children: Vec<CallTreeNode>,
}

impl CallTreeNode {
    pub fn new(address: Address, call_type: CallType) -> Self {
        Self {
            address,
            call_type,
            calldata: Bytes::new(),
            return_data: Bytes::new(),
            failed: false,
            gas_cost: 0,
            value: U256::ZERO,
            children: Vec::new(),
        }
    }

    /// Total gas for the subtree, computed on demand.
    pub fn subtree_gas(&self) -> u64 {
        self.gas_cost
            + self
                .children
                .iter()
                .map(CallTreeNode::subtree_gas)
                .sum::<u64>()
    }

    /// Pre-order walk over the subtree.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a CallTreeNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

fn field<'v>(raw: &'v Value, name: &str) -> &'v Value {
    raw.get(name).unwrap_or(&Value::Null)
}

fn optional_u64(raw: &Value, name: &str) -> Result<u64, EngineError> {
    match field(raw, name) {
        Value::Null => Ok(0),
        v => quantity::to_u64(v, name),
    }
}

fn optional_u256(raw: &Value, name: &str) -> Result<U256, EngineError> {
    match field(raw, name) {
        Value::Null => Ok(U256::ZERO),
        v => quantity::to_u256(v, name),
    }
}

fn optional_bytes(raw: &Value, name: &str) -> Bytes {
    field(raw, name)
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn optional_address(raw: &Value, name: &str) -> Address {
    field(raw, name)
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Address::ZERO)
}

fn bad_trace(message: impl Into<String>) -> EngineError {
    EngineError::Provider {
        code: 0,
        message: format!("unusable trace payload: {}", message.into()),
        data: None,
    }
}

/// Build a call tree from a geth call-tracer frame.
///
/// The tracer reports cumulative `gasUsed` per frame; children's totals
/// are subtracted so each node carries its own gas only.
pub fn from_call_tracer(raw: &Value) -> Result<CallTreeNode, EngineError> {
    let label = field(raw, "type")
        .as_str()
        .ok_or_else(|| bad_trace("call frame without type"))?;
    let call_type =
        CallType::from_label(label).ok_or_else(|| bad_trace(format!("call type {label}")))?;

    let mut node = CallTreeNode::new(optional_address(raw, "to"), call_type);
    node.calldata = optional_bytes(raw, "input");
    node.return_data = optional_bytes(raw, "output");
    node.value = optional_u256(raw, "value")?;
    node.failed = !field(raw, "error").is_null();

    let cumulative = optional_u64(raw, "gasUsed")?;
    let mut children_gas = 0u64;
    if let Some(calls) = field(raw, "calls").as_array() {
        for call in calls {
            let child = from_call_tracer(call)?;
            children_gas += child.subtree_gas();
            node.children.push(child);
        }
    }
    node.gas_cost = cumulative.saturating_sub(children_gas);
    Ok(node)
}

/// Build a call tree from a parity-style flat trace array.
///
/// Items address their position with `traceAddress` paths; the array is
/// re-assembled into a tree and cumulative gas is pushed down the same
/// way as for the call tracer.
pub fn from_parity(items: &[Value]) -> Result<CallTreeNode, EngineError> {
    let mut by_path: HashMap<Vec<usize>, &Value> = HashMap::with_capacity(items.len());
    for item in items {
        let path = field(item, "traceAddress")
            .as_array()
            .ok_or_else(|| bad_trace("item without traceAddress"))?
            .iter()
            .map(|v| v.as_u64().map(|n| n as usize))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| bad_trace("malformed traceAddress"))?;
        by_path.insert(path, item);
    }
    if !by_path.contains_key(&Vec::new()) {
        return Err(bad_trace("no root item"));
    }
    build_parity_subtree(&Vec::new(), &by_path)
}

fn build_parity_subtree(
    path: &[usize],
    by_path: &HashMap<Vec<usize>, &Value>,
) -> Result<CallTreeNode, EngineError> {
    let raw = by_path[path];
    let mut node = parse_parity_item(raw)?;

    let mut children_gas = 0u64;
    for index in 0.. {
        let mut child_path = path.to_vec();
        child_path.push(index);
        if !by_path.contains_key(&child_path) {
            break;
        }
        let child = build_parity_subtree(&child_path, by_path)?;
        children_gas += child.subtree_gas();
        node.children.push(child);
    }
    node.gas_cost = node.gas_cost.saturating_sub(children_gas);
    Ok(node)
}

fn parse_parity_item(raw: &Value) -> Result<CallTreeNode, EngineError> {
    let action = field(raw, "action");
    let result = field(raw, "result");
    let kind = field(raw, "type").as_str().unwrap_or("call");
    let failed = !field(raw, "error").is_null();

    let mut node = match kind {
        "create" => {
            let call_type = match field(action, "creationMethod").as_str() {
                Some("create2") => CallType::Create2,
                _ => CallType::Create,
            };
            // Deployed address lives in the result.
            let mut node = CallTreeNode::new(optional_address(result, "address"), call_type);
            node.calldata = optional_bytes(action, "init");
            node.return_data = optional_bytes(result, "code");
            node
        }
        _ => {
            let call_type = field(action, "callType")
                .as_str()
                .and_then(CallType::from_label)
                .unwrap_or(CallType::Call);
            let mut node = CallTreeNode::new(optional_address(action, "to"), call_type);
            node.calldata = optional_bytes(action, "input");
            node.return_data = optional_bytes(result, "output");
            node
        }
    };
    node.value = optional_u256(action, "value")?;
    node.failed = failed;
    // Temporarily cumulative; the builder subtracts children.
    node.gas_cost = optional_u64(result, "gasUsed")?;
    Ok(node)
}

/// Root-call template for struct-log reconstruction, taken from the
/// transaction and its receipt.
#[derive(Clone, Debug)]
pub struct RootCall {
    pub address: Address,
    pub call_type: CallType,
    pub calldata: Bytes,
    pub value: U256,
    pub failed: bool,
}

/// Incremental call-tree reconstruction from opcode frames, so frames can
/// be folded in as they stream off the wire instead of being collected
/// first. Opcode-level traces run to millions of frames.
///
/// Call-family opcodes push a new node and a depth decrease pops back to
/// the parent. This is the most failure-prone strategy: targets come from
/// the stack when present and creations cannot recover their deployed
/// address, so it is only attempted when no native call tracer exists.
pub struct StructLogBuilder {
    open: Vec<CallTreeNode>,
    pending: Option<CallTreeNode>,
}

impl StructLogBuilder {
    pub fn new(root: RootCall) -> Self {
        let mut root_node = CallTreeNode::new(root.address, root.call_type);
        root_node.calldata = root.calldata;
        root_node.value = root.value;
        root_node.failed = root.failed;
        Self {
            open: vec![root_node],
            pending: None,
        }
    }

    /// Fold in the next frame of the trace.
    pub fn push(&mut self, frame: TraceFrame) {
        let depth = frame.depth.max(1) as usize;
        if depth > self.open.len() {
            // The previous call opcode actually entered a child frame.
            let child = self
                .pending
                .take()
                .unwrap_or_else(|| CallTreeNode::new(Address::ZERO, CallType::Call));
            self.open.push(child);
        } else {
            // A call that never deepened (precompile or instant return)
            // still counts as a child.
            if let Some(child) = self.pending.take() {
                attach_child(&mut self.open, child);
            }
            while depth < self.open.len() {
                let done = self.open.pop().expect("open stack is non-empty");
                attach_child(&mut self.open, done);
            }
        }

        match CallType::from_opcode(&frame.op) {
            Some(call_type) => {
                let target = frame.call_target().unwrap_or(Address::ZERO);
                self.pending = Some(CallTreeNode::new(target, call_type));
            }
            None => {
                let top = self.open.last_mut().expect("open stack is non-empty");
                top.gas_cost += frame.gas_cost;
                if frame.op == "REVERT" {
                    top.failed = true;
                }
            }
        }
    }

    /// Close any still-open frames and hand back the root.
    pub fn finish(mut self) -> CallTreeNode {
        if let Some(child) = self.pending.take() {
            attach_child(&mut self.open, child);
        }
        while self.open.len() > 1 {
            let done = self.open.pop().expect("more than one open node");
            attach_child(&mut self.open, done);
        }
        self.open.pop().expect("root remains")
    }
}

/// Reconstruct a call tree from an already-materialized frame sequence.
pub fn from_struct_logs(
    root: RootCall,
    frames: impl IntoIterator<Item = TraceFrame>,
) -> CallTreeNode {
    let mut builder = StructLogBuilder::new(root);
    for frame in frames {
        builder.push(frame);
    }
    builder.finish()
}

fn attach_child(open: &mut Vec<CallTreeNode>, child: CallTreeNode) {
    open.last_mut()
        .expect("attach always has a parent")
        .children
        .push(child);
}
