// Rewind - EVM State Time Machine
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Decoding of execution-client JSON into Rewind records.
//!
//! Field names follow the `eth_*` namespace (camelCase, `0x` quantities). Missing
//! optional fields decode to their empty value; missing required fields are
//! [`AdapterError::Decode`].

use alloy_primitives::{Address, Bytes, B256, U256};
use rewind_common::{
    format_quantity, parse_u64, AdapterError, Block, CallTrace, TimelineEvent, TimelineEventKind,
    Transaction, TransactionRequest,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

/// `0x` quantity for a `u64`.
pub fn hex_u64(value: u64) -> String {
    format_quantity(U256::from(value))
}

fn object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, AdapterError> {
    value.as_object().ok_or_else(|| AdapterError::Decode(format!("{what} is not an object")))
}

fn required<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    field: &str,
    what: &str,
) -> Result<T, AdapterError> {
    let value = obj
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| AdapterError::Decode(format!("{what} has no '{field}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| AdapterError::Decode(format!("{what}.{field}: {e}")))
}

fn optional<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    field: &str,
    what: &str,
) -> Result<Option<T>, AdapterError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| AdapterError::Decode(format!("{what}.{field}: {e}"))),
    }
}

fn quantity(obj: &Map<String, Value>, field: &str, what: &str) -> Result<u64, AdapterError> {
    obj.get(field)
        .and_then(parse_u64)
        .ok_or_else(|| AdapterError::Decode(format!("{what}.{field} is not a quantity")))
}

fn optional_quantity(obj: &Map<String, Value>, field: &str) -> Option<u64> {
    obj.get(field).and_then(parse_u64)
}

/// Decodes an `eth_getBlockByNumber(.., true)` result.
pub fn block_from_rpc(value: &Value) -> Result<Block, AdapterError> {
    let obj = object(value, "block")?;
    let transactions = match obj.get("transactions") {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|item| item.is_object())
            .map(transaction_from_rpc)
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    Ok(Block {
        number: quantity(obj, "number", "block")?,
        hash: required(obj, "hash", "block")?,
        parent_hash: optional(obj, "parentHash", "block")?.unwrap_or_default(),
        timestamp: quantity(obj, "timestamp", "block")?,
        gas_used: optional_quantity(obj, "gasUsed").unwrap_or_default(),
        gas_limit: optional_quantity(obj, "gasLimit").unwrap_or_default(),
        transactions,
    })
}

/// Decodes an `eth_getTransactionByHash` result or a full block transaction.
pub fn transaction_from_rpc(value: &Value) -> Result<Transaction, AdapterError> {
    let obj = object(value, "transaction")?;
    Ok(Transaction {
        hash: required(obj, "hash", "transaction")?,
        block_number: optional_quantity(obj, "blockNumber"),
        transaction_index: optional_quantity(obj, "transactionIndex"),
        from: required(obj, "from", "transaction")?,
        to: optional(obj, "to", "transaction")?,
        value: optional(obj, "value", "transaction")?.unwrap_or_default(),
        input: optional::<Bytes>(obj, "input", "transaction")?.unwrap_or_default(),
        nonce: optional_quantity(obj, "nonce").unwrap_or_default(),
        gas: optional_quantity(obj, "gas").unwrap_or_default(),
    })
}

/// Decodes a `callTracer` frame, recursively.
pub fn call_trace_from_rpc(value: &Value) -> Result<CallTrace, AdapterError> {
    let obj = object(value, "call frame")?;
    let calls = match obj.get("calls") {
        Some(Value::Array(frames)) => {
            frames.iter().map(call_trace_from_rpc).collect::<Result<Vec<_>, _>>()?
        }
        _ => Vec::new(),
    };
    Ok(CallTrace {
        call_type: optional::<String>(obj, "type", "call frame")?.unwrap_or_else(|| "CALL".into()),
        from: required(obj, "from", "call frame")?,
        to: optional(obj, "to", "call frame")?,
        value: optional(obj, "value", "call frame")?,
        gas_used: optional_quantity(obj, "gasUsed").unwrap_or_default(),
        input: optional::<Bytes>(obj, "input", "call frame")?.unwrap_or_default(),
        output: optional::<Bytes>(obj, "output", "call frame")?.unwrap_or_default(),
        error: optional(obj, "error", "call frame")?,
        calls,
    })
}

/// Decodes an `eth_getLogs` entry into a timeline event.
pub fn log_event_from_rpc(value: &Value, block_number: u64) -> Result<TimelineEvent, AdapterError> {
    let obj = object(value, "log")?;
    Ok(TimelineEvent {
        block_number: optional_quantity(obj, "blockNumber").unwrap_or(block_number),
        kind: TimelineEventKind::Log {
            address: required::<Address>(obj, "address", "log")?,
            topics: optional::<Vec<B256>>(obj, "topics", "log")?.unwrap_or_default(),
            data: optional::<Bytes>(obj, "data", "log")?.unwrap_or_default(),
            transaction_hash: optional(obj, "transactionHash", "log")?,
            log_index: optional_quantity(obj, "logIndex").unwrap_or_default(),
        },
    })
}

/// Block and transaction events of a decoded block, in inclusion order.
pub fn block_events(block: &Block) -> Vec<TimelineEvent> {
    let mut events = Vec::with_capacity(block.transactions.len() + 1);
    events.push(TimelineEvent {
        block_number: block.number,
        kind: TimelineEventKind::Block {
            hash: block.hash,
            timestamp: block.timestamp,
            tx_count: block.transactions.len(),
        },
    });
    for (position, tx) in block.transactions.iter().enumerate() {
        events.push(TimelineEvent {
            block_number: block.number,
            kind: TimelineEventKind::Transaction {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
                index: tx.transaction_index.unwrap_or(position as u64),
            },
        });
    }
    events
}

/// Encodes a transaction request for `eth_sendTransaction` / `eth_estimateGas`.
pub fn request_to_rpc(tx: &TransactionRequest) -> Value {
    let mut request = json!({
        "from": tx.from,
        "value": format_quantity(tx.value),
        "data": tx.data,
    });
    if let Some(to) = tx.to {
        request["to"] = json!(to);
    }
    if let Some(gas) = tx.gas {
        request["gas"] = json!(hex_u64(gas));
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Value {
        json!({
            "number": "0x64",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "timestamp": "0x6553f100",
            "gasUsed": "0x5208",
            "gasLimit": "0x1c9c380",
            "transactions": [{
                "hash": "0x3333333333333333333333333333333333333333333333333333333333333333",
                "blockNumber": "0x64",
                "transactionIndex": "0x0",
                "from": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "to": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                "value": "0x1",
                "input": "0x",
                "nonce": "0x0",
                "gas": "0x5208"
            }]
        })
    }

    #[test]
    fn test_block_decoding() {
        let block = block_from_rpc(&sample_block()).unwrap();
        assert_eq!(block.number, 100);
        assert_eq!(block.gas_used, 21_000);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].value, U256::from(1u64));

        let events = block_events(&block);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, TimelineEventKind::Block { tx_count: 1, .. }));
    }

    #[test]
    fn test_block_without_hash_is_rejected() {
        let mut block = sample_block();
        block["hash"] = Value::Null;
        assert!(matches!(block_from_rpc(&block), Err(AdapterError::Decode(_))));
    }

    #[test]
    fn test_call_trace_decoding() {
        let frame = json!({
            "type": "CALL",
            "from": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "to": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            "gasUsed": "0x100",
            "input": "0x",
            "calls": [{
                "type": "STATICCALL",
                "from": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                "to": "0xcccccccccccccccccccccccccccccccccccccccc",
                "gasUsed": "0x10",
                "input": "0x",
                "error": "execution reverted"
            }]
        });
        let trace = call_trace_from_rpc(&frame).unwrap();
        assert_eq!(trace.gas_used, 256);
        assert_eq!(trace.frame_count(), 2);
        assert_eq!(trace.calls[0].error.as_deref(), Some("execution reverted"));
    }

    #[test]
    fn test_request_encoding() {
        let request = request_to_rpc(&TransactionRequest {
            gas: Some(21_000),
            value: U256::from(2u64),
            ..Default::default()
        });
        assert_eq!(request["gas"], json!("0x5208"));
        assert_eq!(request["value"], json!("0x2"));
        assert!(request.get("to").is_none());
    }
}
