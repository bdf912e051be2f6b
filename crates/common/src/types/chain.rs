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

//! Chain-facing records returned by VM adapters.

use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A block with its full transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number
    pub number: u64,
    /// Block hash
    pub hash: B256,
    /// Parent hash
    pub parent_hash: B256,
    /// Unix timestamp
    pub timestamp: u64,
    /// Gas used by all transactions
    pub gas_used: u64,
    /// Block gas limit
    pub gas_limit: u64,
    /// Transactions in inclusion order
    pub transactions: Vec<Transaction>,
}

/// A mined or pending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash
    pub hash: B256,
    /// Including block, if mined
    pub block_number: Option<u64>,
    /// Position in the block, if mined
    pub transaction_index: Option<u64>,
    /// Sender
    pub from: Address,
    /// Recipient; `None` for contract creation
    pub to: Option<Address>,
    /// Transferred value
    pub value: U256,
    /// Calldata
    pub input: Bytes,
    /// Sender nonce
    pub nonce: u64,
    /// Gas limit
    pub gas: u64,
}

/// Transaction to submit or estimate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Sender; adapters impersonate it when the backend allows
    pub from: Address,
    /// Recipient
    pub to: Option<Address>,
    /// Value
    #[serde(default)]
    pub value: U256,
    /// Calldata
    #[serde(default)]
    pub data: Bytes,
    /// Gas limit, estimated by the backend when absent
    #[serde(default)]
    pub gas: Option<u64>,
}

/// Result of executing a [`TransactionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Submitted transaction hash
    pub hash: B256,
    /// Raw receipt as returned by the backend
    pub receipt: Value,
    /// Block the transaction was mined in
    pub block_number: u64,
}

impl ExecutionOutcome {
    /// Whether the receipt reports success (`status == 0x1`).
    pub fn succeeded(&self) -> bool {
        self.receipt.get("status").and_then(crate::parse_u64) == Some(1)
    }
}

/// A call frame produced by the `callTracer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTrace {
    /// CALL, STATICCALL, DELEGATECALL, CREATE, ...
    pub call_type: String,
    /// Caller
    pub from: Address,
    /// Callee
    pub to: Option<Address>,
    /// Transferred value
    pub value: Option<U256>,
    /// Gas consumed by the frame
    pub gas_used: u64,
    /// Input data
    pub input: Bytes,
    /// Return data
    pub output: Bytes,
    /// Revert or error reason
    pub error: Option<String>,
    /// Nested frames
    pub calls: Vec<CallTrace>,
}

impl CallTrace {
    /// Number of frames in the tree, including this one.
    pub fn frame_count(&self) -> usize {
        1 + self.calls.iter().map(Self::frame_count).sum::<usize>()
    }
}

/// What happened at a point of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    /// A new block
    Block {
        /// Block hash
        hash: B256,
        /// Block timestamp
        timestamp: u64,
        /// Number of transactions
        tx_count: usize,
    },
    /// A transaction included in the block
    Transaction {
        /// Transaction hash
        hash: B256,
        /// Sender
        from: Address,
        /// Recipient
        to: Option<Address>,
        /// Position in the block
        index: u64,
    },
    /// A log emitted in the block
    Log {
        /// Emitting contract
        address: Address,
        /// Indexed topics
        topics: Vec<B256>,
        /// Non-indexed data
        data: Bytes,
        /// Emitting transaction
        transaction_hash: Option<B256>,
        /// Position of the log in the block
        log_index: u64,
    },
}

/// One event produced by an event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Block the event belongs to
    pub block_number: u64,
    /// Event payload
    pub kind: TimelineEventKind,
}

/// Per-transaction gas estimation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasEstimate {
    /// Position in the request batch
    pub index: usize,
    /// Estimated gas on success
    pub estimate: Option<u64>,
    /// Backend error on failure
    pub error: Option<String>,
}

impl GasEstimate {
    /// Successful estimate.
    pub fn ok(index: usize, estimate: u64) -> Self {
        Self { index, estimate: Some(estimate), error: None }
    }

    /// Failed estimate.
    pub fn err(index: usize, error: impl Into<String>) -> Self {
        Self { index, estimate: None, error: Some(error.into()) }
    }
}

/// Accounts and storage slots to materialize into a [`State`](crate::State).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateQuery {
    /// Accounts to read, each with the storage slots of interest
    pub accounts: BTreeMap<Address, BTreeSet<U256>>,
}

impl StateQuery {
    /// Query covering `addresses` without storage.
    pub fn for_accounts(addresses: impl IntoIterator<Item = Address>) -> Self {
        let mut query = Self::default();
        for address in addresses {
            query.add_account(address);
        }
        query
    }

    /// Adds an account.
    pub fn add_account(&mut self, address: Address) -> &mut Self {
        self.accounts.entry(address).or_default();
        self
    }

    /// Adds a storage slot, and its account.
    pub fn add_slot(&mut self, address: Address, slot: U256) -> &mut Self {
        self.accounts.entry(address).or_default().insert(slot);
        self
    }

    /// Unions another query into this one.
    pub fn merge(&mut self, other: &Self) {
        for (address, slots) in &other.accounts {
            self.accounts.entry(*address).or_default().extend(slots.iter().copied());
        }
    }

    /// Whether no account is requested.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
