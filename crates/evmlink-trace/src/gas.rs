//! Per-method gas aggregation over call trees.

use std::collections::BTreeMap;

use alloy::primitives::Address;
use glob::{Pattern, PatternError};

use crate::calltree::CallTreeNode;

/// Gas samples keyed by contract, then by method identifier.
///
/// Merging two reports concatenates sample lists under the same keys, so
/// the merge is associative and commutative regardless of traversal
/// order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GasReport(pub BTreeMap<String, BTreeMap<String, Vec<u64>>>);

impl GasReport {
    pub fn add(&mut self, contract: String, method: String, gas: u64) {
        self.0
            .entry(contract)
            .or_default()
            .entry(method)
            .or_default()
            .push(gas);
    }

    pub fn merge(&mut self, other: GasReport) {
        for (contract, methods) in other.0 {
            let slot = self.0.entry(contract).or_default();
            for (method, mut samples) in methods {
                slot.entry(method).or_default().append(&mut samples);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Glob-style exclusion rule matched against contract and method labels.
#[derive(Clone, Debug)]
pub struct GasExclusion {
    contract: Pattern,
    method: Pattern,
}

impl GasExclusion {
    pub fn new(contract: &str, method: &str) -> Result<Self, PatternError> {
        Ok(Self {
            contract: Pattern::new(contract)?,
            method: Pattern::new(method)?,
        })
    }

    fn matches(&self, contract: &str, method: &str) -> bool {
        self.contract.matches(contract) && self.method.matches(method)
    }
}

/// Aggregate a gas report over a call tree, post-order.
///
/// Children always contribute; the node's own entry is added only when it
/// is not excluded, not a plain value transfer, and not a precompile
/// call. A dropped node's gas is dropped, never reattributed to its
/// parent or children.
pub fn gas_report(root: &CallTreeNode, exclusions: &[GasExclusion]) -> GasReport {
    let mut report = GasReport::default();
    for child in &root.children {
        report.merge(gas_report(child, exclusions));
    }

    let contract = contract_label(root.address);
    let method = method_label(root);
    let dropped = is_plain_transfer(root)
        || is_precompile(root.address)
        || exclusions.iter().any(|e| e.matches(&contract, &method));
    if !dropped {
        report.add(contract, method, root.gas_cost);
    }
    report
}

fn contract_label(address: Address) -> String {
    format!("{address}")
}

fn method_label(node: &CallTreeNode) -> String {
    if node.call_type.is_create() {
        return "constructor".to_string();
    }
    if node.calldata.len() >= 4 {
        let selector = &node.calldata[..4];
        format!(
            "0x{:02x}{:02x}{:02x}{:02x}",
            selector[0], selector[1], selector[2], selector[3]
        )
    } else {
        "fallback".to_string()
    }
}

fn is_plain_transfer(node: &CallTreeNode) -> bool {
    node.calldata.is_empty() && !node.call_type.is_create()
}

fn is_precompile(address: Address) -> bool {
    let bytes = address.as_slice();
    bytes[..19].iter().all(|b| *b == 0) && (1..=9).contains(&bytes[19])
}
