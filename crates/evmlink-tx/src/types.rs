//! Transaction data model: the mutable pending transaction and the
//! immutable receipt.

use alloy::primitives::{Address, B256, Bytes, U256};
use serde_json::{json, Map, Value};

use evmlink_rpc::errors::EngineError;
use evmlink_rpc::quantity;

/// Wire type of a pending transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxType {
    /// Type 0, gas-price fee field.
    Legacy,
    /// Type 1 (EIP-2930), gas price plus access list.
    AccessList,
    /// Type 2 (EIP-1559), max fee / max priority fee.
    Eip1559,
}

/// Gas limit policy for preparation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GasLimit {
    /// Estimate, multiply, cap at the block gas limit.
    Auto,
    /// Use the block gas limit verbatim.
    Max,
    /// Caller-supplied, used verbatim.
    Fixed(u64),
}

/// One EIP-2930 access-list entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessListEntry {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

impl AccessListEntry {
    pub fn to_rpc(&self) -> Value {
        json!({
            "address": format!("{}", self.address),
            "storageKeys": self.storage_keys.iter().map(|k| format!("{k}")).collect::<Vec<_>>(),
        })
    }

    pub fn from_rpc(raw: &Value) -> Result<Self, EngineError> {
        let address =
            quantity::to_address(raw.get("address").unwrap_or(&Value::Null), "accessList.address")?;
        let storage_keys = raw
            .get("storageKeys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .map(|k| quantity::to_b256(k, "accessList.storageKeys"))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            address,
            storage_keys,
        })
    }
}

/// A transaction being assembled for submission.
///
/// Mutable while unsigned; once a raw signed payload is attached the
/// pipeline treats the fields as frozen and submits the payload verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingTransaction {
    pub sender: Address,
    /// `None` means contract creation.
    pub receiver: Option<Address>,
    pub nonce: Option<u64>,
    pub value: U256,
    pub data: Bytes,
    pub tx_type: TxType,
    /// Legacy / access-list fee field, in Wei.
    pub gas_price: Option<u128>,
    /// EIP-1559 ceiling, in Wei.
    pub max_fee: Option<u128>,
    /// EIP-1559 tip, in Wei.
    pub max_priority_fee: Option<u128>,
    pub gas_limit: GasLimit,
    pub access_list: Option<Vec<AccessListEntry>>,
    pub chain_id: Option<u64>,
    /// Caller override; negative values are rejected at prepare time.
    pub required_confirmations: Option<i64>,
    /// RLP payload of the externally-signed transaction, when present.
    pub raw_signed: Option<Bytes>,
}

impl PendingTransaction {
    pub fn new(sender: Address, tx_type: TxType) -> Self {
        Self {
            sender,
            receiver: None,
            nonce: None,
            value: U256::ZERO,
            data: Bytes::new(),
            tx_type,
            gas_price: None,
            max_fee: None,
            max_priority_fee: None,
            gas_limit: GasLimit::Auto,
            access_list: None,
            chain_id: None,
            required_confirmations: None,
            raw_signed: None,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.raw_signed.is_some()
    }

    /// Attach an externally-produced signed payload, freezing the fields.
    pub fn attach_signature(&mut self, raw: Bytes) {
        self.raw_signed = Some(raw);
    }

    /// RPC call object for `eth_call` / `eth_estimateGas` /
    /// `eth_createAccessList` / `eth_sendTransaction`.
    ///
    /// Zero value and empty calldata are omitted by convention; fee and
    /// nonce fields appear only once filled.
    pub fn to_call_object(&self) -> Value {
        let mut object = Map::new();
        object.insert("from".to_string(), json!(format!("{}", self.sender)));
        if let Some(to) = self.receiver {
            object.insert("to".to_string(), json!(format!("{to}")));
        }
        if let Some(value) = quantity::nonzero(self.value) {
            object.insert("value".to_string(), json!(value));
        }
        if !self.data.is_empty() {
            object.insert("data".to_string(), json!(format!("{}", self.data)));
        }
        if let Some(nonce) = self.nonce {
            object.insert("nonce".to_string(), json!(quantity::from_u64(nonce)));
        }
        if let GasLimit::Fixed(gas) = self.gas_limit {
            object.insert("gas".to_string(), json!(quantity::from_u64(gas)));
        }
        if let Some(gas_price) = self.gas_price {
            object.insert(
                "gasPrice".to_string(),
                json!(quantity::from_u256(U256::from(gas_price))),
            );
        }
        if let Some(max_fee) = self.max_fee {
            object.insert(
                "maxFeePerGas".to_string(),
                json!(quantity::from_u256(U256::from(max_fee))),
            );
        }
        if let Some(tip) = self.max_priority_fee {
            object.insert(
                "maxPriorityFeePerGas".to_string(),
                json!(quantity::from_u256(U256::from(tip))),
            );
        }
        if let Some(entries) = &self.access_list {
            object.insert(
                "accessList".to_string(),
                Value::Array(entries.iter().map(AccessListEntry::to_rpc).collect()),
            );
        }
        Value::Object(object)
    }
}

/// Outcome recorded in a receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Failed,
}

/// The node's record of a mined transaction. Never mutated after
/// creation; cached by hash, and a second lookup returns the same object.
#[derive(Clone, Debug)]
pub struct Receipt {
    pub txn_hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
    /// Gas limit of the mined transaction, read back from the node.
    pub gas_limit: u64,
    pub effective_gas_price: u128,
    pub status: TxStatus,
    pub sender: Address,
    pub receiver: Option<Address>,
    /// Deployed address for creation transactions.
    pub contract_address: Option<Address>,
    /// Raw log records in emission order.
    pub logs: Vec<Value>,
}

impl Receipt {
    /// Map a raw `eth_getTransactionReceipt` result, with the gas limit
    /// taken from the mined transaction object.
    pub fn from_rpc(raw: &Value, gas_limit: u64) -> Result<Self, EngineError> {
        let field = |name: &str| raw.get(name).unwrap_or(&Value::Null);
        let status = match quantity::to_u64(field("status"), "receipt.status")? {
            1 => TxStatus::Success,
            _ => TxStatus::Failed,
        };
        let receiver = match field("to") {
            Value::Null => None,
            v => Some(quantity::to_address(v, "receipt.to")?),
        };
        let contract_address = match field("contractAddress") {
            Value::Null => None,
            v => Some(quantity::to_address(v, "receipt.contractAddress")?),
        };
        let effective_gas_price = match field("effectiveGasPrice") {
            Value::Null => 0,
            v => quantity::to_u128(v, "receipt.effectiveGasPrice")?,
        };
        Ok(Self {
            txn_hash: quantity::to_b256(field("transactionHash"), "receipt.transactionHash")?,
            block_hash: quantity::to_b256(field("blockHash"), "receipt.blockHash")?,
            block_number: quantity::to_u64(field("blockNumber"), "receipt.blockNumber")?,
            gas_used: quantity::to_u64(field("gasUsed"), "receipt.gasUsed")?,
            gas_limit,
            effective_gas_price,
            status,
            sender: quantity::to_address(field("from"), "receipt.from")?,
            receiver,
            contract_address,
            logs: field("logs").as_array().cloned().unwrap_or_default(),
        })
    }

    /// Error out when the receipt records a failure.
    ///
    /// Exhausting the gas limit reads as out-of-gas; anything else is a
    /// generic failure naming the hash.
    pub fn raise_for_status(&self) -> Result<(), EngineError> {
        match self.status {
            TxStatus::Success => Ok(()),
            TxStatus::Failed if self.gas_used == self.gas_limit => Err(EngineError::OutOfGas),
            TxStatus::Failed => Err(EngineError::Transaction(format!(
                "transaction {} failed",
                self.txn_hash
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_receipt(status: u64, gas_used: u64, gas_limit: u64) -> Receipt {
        let raw = json!({
            "transactionHash": "0x3333333333333333333333333333333333333333333333333333333333333333",
            "blockHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "blockNumber": "0xa",
            "gasUsed": quantity::from_u64(gas_used),
            "effectiveGasPrice": "0x4a817c800",
            "status": quantity::from_u64(status),
            "from": "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
            "to": "0x70997970c51812e339d9b73b0245ad59e15ebbf9",
            "contractAddress": null,
            "logs": [],
        });
        Receipt::from_rpc(&raw, gas_limit).expect("valid receipt")
    }

    #[test]
    fn successful_receipt_passes_status_check() {
        let receipt = sample_receipt(1, 21_000, 30_000);
        assert_eq!(receipt.status, TxStatus::Success);
        assert!(receipt.raise_for_status().is_ok());
    }

    #[test]
    fn exhausted_gas_reads_as_out_of_gas() {
        let receipt = sample_receipt(0, 30_000, 30_000);
        assert!(matches!(
            receipt.raise_for_status(),
            Err(EngineError::OutOfGas)
        ));
    }

    #[test]
    fn other_failures_name_the_hash() {
        let receipt = sample_receipt(0, 21_000, 30_000);
        match receipt.raise_for_status() {
            Err(EngineError::Transaction(message)) => {
                assert!(message.contains("0x3333"), "message should name the hash");
            }
            other => panic!("expected Transaction error, got {other:?}"),
        }
    }

    #[test]
    fn call_object_omits_zero_value_and_empty_data() {
        let sender: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
            .parse()
            .unwrap();
        let txn = PendingTransaction::new(sender, TxType::Legacy);
        let object = txn.to_call_object();
        assert!(object.get("value").is_none());
        assert!(object.get("data").is_none());
        assert!(object.get("to").is_none());
        assert_eq!(object["from"], json!(format!("{sender}")));
    }

    #[test]
    fn call_object_carries_prepared_fields() {
        let sender: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
            .parse()
            .unwrap();
        let mut txn = PendingTransaction::new(sender, TxType::Eip1559);
        txn.nonce = Some(7);
        txn.max_fee = Some(122);
        txn.max_priority_fee = Some(2);
        txn.gas_limit = GasLimit::Fixed(21_000);
        txn.value = U256::from(5u64);
        let object = txn.to_call_object();
        assert_eq!(object["nonce"], json!("0x7"));
        assert_eq!(object["maxFeePerGas"], json!("0x7a"));
        assert_eq!(object["maxPriorityFeePerGas"], json!("0x2"));
        assert_eq!(object["gas"], json!("0x5208"));
        assert_eq!(object["value"], json!("0x5"));
    }

    #[test]
    fn access_list_round_trips_through_rpc_shape() {
        let entry = AccessListEntry {
            address: "0x70997970c51812e339d9b73b0245ad59e15ebbf9".parse().unwrap(),
            storage_keys: vec![B256::ZERO],
        };
        let raw = entry.to_rpc();
        let back = AccessListEntry::from_rpc(&raw).expect("parse entry");
        assert_eq!(back, entry);
    }
}
