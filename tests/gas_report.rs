//! Integration tests for call-tree gas reporting.

mod common;

use alloy::primitives::{Address, B256};
use serde_json::json;

use common::*;
use evmlink_trace::{gas_report, CallTreeNode, CallType, GasExclusion, GasReport, TraceEngine};

fn node(addr_byte: u8, selector: [u8; 4], gas: u64) -> CallTreeNode {
    let mut node = CallTreeNode::new(Address::repeat_byte(addr_byte), CallType::Call);
    node.calldata = selector.to_vec().into();
    node.gas_cost = gas;
    node
}

fn label(addr_byte: u8) -> String {
    format!("{}", Address::repeat_byte(addr_byte))
}

/// Order of subtree traversal must not affect the final report.
#[test]
fn merge_grouping_does_not_change_the_report() {
    let trees = [
        node(0x01, [0x11, 0x22, 0x33, 0x44], 10),
        node(0x01, [0x11, 0x22, 0x33, 0x44], 20),
        node(0x02, [0xde, 0xad, 0xbe, 0xef], 5),
    ];
    let reports: Vec<GasReport> = trees.iter().map(|t| gas_report(t, &[])).collect();

    let mut left_first = reports[0].clone();
    left_first.merge(reports[1].clone());
    left_first.merge(reports[2].clone());

    let mut right_first = reports[1].clone();
    right_first.merge(reports[2].clone());
    let mut outer = reports[0].clone();
    outer.merge(right_first);

    assert_eq!(left_first, outer);
}

/// An excluded node's gas disappears entirely; it is not reattributed to
/// its parent or its siblings.
#[test]
fn excluded_gas_is_dropped_not_reattributed() {
    let mut root = CallTreeNode::new(Address::repeat_byte(0xaa), CallType::Call);
    root.gas_cost = 0; // plain transfer wrapper, empty calldata
    root.children = vec![
        node(0x01, [0xde, 0xad, 0xbe, 0xef], 10),
        node(0x02, [0xca, 0xfe, 0xba, 0xbe], 5),
    ];

    let exclude = GasExclusion::new(&label(0x01), "*").expect("valid glob");
    let report = gas_report(&root, &[exclude]);

    assert_eq!(report.0.len(), 1, "only B survives");
    assert_eq!(report.0[&label(0x02)]["0xcafebabe"], vec![5]);
}

#[test]
fn nested_calls_report_under_their_own_contracts() {
    let mut root = node(0x01, [0x11, 0x22, 0x33, 0x44], 100);
    let mut inner = node(0x02, [0xde, 0xad, 0xbe, 0xef], 40);
    inner.children.push(node(0x01, [0x11, 0x22, 0x33, 0x44], 7));
    root.children.push(inner);

    let report = gas_report(&root, &[]);
    assert_eq!(report.0[&label(0x01)]["0x11223344"], vec![7, 100]);
    assert_eq!(report.0[&label(0x02)]["0xdeadbeef"], vec![40]);
}

/// Full path: trace a transaction through the engine and aggregate its
/// gas report, with the call tracer as the discovered backend.
#[tokio::test]
async fn engine_gas_report_over_a_traced_transaction() -> eyre::Result<()> {
    init_tracing();
    let chain = FakeChain::new();
    let callee = Address::repeat_byte(0x02);
    chain.transport.respond_with(
        "debug_traceTransaction",
        json!({
            "type": "CALL",
            "to": format!("{}", Address::repeat_byte(0x01)),
            "input": "0x11223344",
            "gasUsed": "0x64",
            "calls": [{
                "type": "STATICCALL",
                "to": format!("{callee}"),
                "input": "0xdeadbeef",
                "gasUsed": "0x28",
            }],
        }),
    );
    let conn = chain.connect().await;

    let report = TraceEngine::new(&conn)
        .gas_report(B256::repeat_byte(0x11), &[])
        .await?;
    assert_eq!(report.0[&label(0x01)]["0x11223344"], vec![0x64 - 0x28]);
    assert_eq!(report.0[&label(0x02)]["0xdeadbeef"], vec![0x28]);
    Ok(())
}
