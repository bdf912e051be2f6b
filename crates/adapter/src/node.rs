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

//! Adapter for an already running JSON-RPC node.
//!
//! The node's dialect decides which state override namespace is used. Anvil and
//! Hardhat expose the same override surface under different prefixes; Geth has none,
//! so state patches and backend snapshots are unsupported there and historical reads
//! rely on block tags alone.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use rewind_common::{
    format_address, format_quantity, format_word, AdapterError, Block, CallTrace,
    ExecutionOutcome, GasEstimate, PatchOperation, SnapshotHandle, State, StateMutation,
    StateQuery, Transaction, TransactionRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    convert::{
        block_events, block_from_rpc, call_trace_from_rpc, hex_u64, log_event_from_rpc,
        request_to_rpc, transaction_from_rpc,
    },
    EventSource, EventStream, RpcClient, VmAdapter, DEFAULT_POLL_INTERVAL,
};

/// Attempts made while waiting for a receipt after submission.
const RECEIPT_MAX_ATTEMPTS: u32 = 50;
/// Delay between receipt polls.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// RPC dialect of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeDialect {
    /// Foundry's anvil: `anvil_*` overrides, `evm_*` snapshots
    Anvil,
    /// Hardhat network: `hardhat_*` overrides, `evm_*` snapshots
    Hardhat,
    /// Geth: no overrides, no snapshots
    Geth,
}

impl NodeDialect {
    /// Namespace of the state override methods.
    pub fn override_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Anvil => Some("anvil"),
            Self::Hardhat => Some("hardhat"),
            Self::Geth => None,
        }
    }

    /// Whether `evm_snapshot`, `evm_revert` and `evm_mine` exist.
    pub fn has_evm_namespace(&self) -> bool {
        !matches!(self, Self::Geth)
    }

    /// Registry tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Anvil => "anvil",
            Self::Hardhat => "hardhat",
            Self::Geth => "geth",
        }
    }
}

/// [`VmAdapter`] over an existing endpoint. No process is owned.
#[derive(Debug, Clone)]
pub struct RpcNodeAdapter {
    tag: String,
    client: RpcClient,
    dialect: NodeDialect,
    poll_interval: Duration,
    ready: bool,
}

impl RpcNodeAdapter {
    /// Adapter for `url` speaking `dialect`.
    pub fn connect(url: impl AsRef<str>, dialect: NodeDialect) -> Self {
        Self::with_client(RpcClient::new(url), dialect)
    }

    /// Adapter over an existing client.
    pub fn with_client(client: RpcClient, dialect: NodeDialect) -> Self {
        Self {
            tag: dialect.tag().to_string(),
            client,
            dialect,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready: false,
        }
    }

    /// Overrides the registry tag reported by [`VmAdapter::backend`].
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Sets the event stream poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Underlying client.
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Node dialect.
    pub fn dialect(&self) -> NodeDialect {
        self.dialect
    }

    /// Marks the adapter ready without probing; used by owners that probed already.
    pub(crate) fn mark_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    fn ensure_ready(&self) -> Result<(), AdapterError> {
        if self.ready {
            Ok(())
        } else {
            Err(AdapterError::NotInitialized)
        }
    }

    fn override_method(&self, name: &str) -> Result<String, AdapterError> {
        self.dialect.override_prefix().map(|prefix| format!("{prefix}_{name}")).ok_or_else(|| {
            AdapterError::Unsupported(format!("{} has no {name} override", self.dialect.tag()))
        })
    }

    async fn call_override(&self, name: &str, params: Value) -> Result<bool, AdapterError> {
        let method = self.override_method(name)?;
        let result = self.client.request_value(&method, params).await?;
        Ok(result.as_bool().unwrap_or(true))
    }

    /// Reads `query` at `tag` (`latest` or a hex block number).
    async fn read_state(&self, tag: &str, query: &StateQuery) -> Result<State, AdapterError> {
        let header = self.client.request_value("eth_getBlockByNumber", json!([tag, false])).await?;
        if header.is_null() {
            return Err(AdapterError::MissingData(format!("block {tag}")));
        }
        let block = block_from_rpc(&header)?;
        let number = hex_u64(block.number);

        let logs: Value = self
            .client
            .request_value("eth_getLogs", json!([{"fromBlock": number, "toBlock": number}]))
            .await?;

        let mut state = State::new();
        state.set_block_number(block.number);
        state.set_timestamp(block.timestamp);
        state.set_gas_used(block.gas_used);
        state.set_logs(logs.as_array().cloned().unwrap_or_default());

        for (address, slots) in &query.accounts {
            let balance: U256 =
                self.client.request("eth_getBalance", json!([address, number])).await?;
            let nonce: U256 =
                self.client.request("eth_getTransactionCount", json!([address, number])).await?;
            let code: alloy_primitives::Bytes =
                self.client.request("eth_getCode", json!([address, number])).await?;

            state.set_balance(address, balance);
            state.set_nonce(address, u64::try_from(nonce).unwrap_or(u64::MAX));
            state.set_code(address, &code);
            for slot in slots {
                let word: U256 = self
                    .client
                    .request("eth_getStorageAt", json!([address, format_quantity(*slot), number]))
                    .await?;
                state.set_storage(address, *slot, word);
            }
        }

        debug!(block = block.number, accounts = query.accounts.len(), "captured state");
        Ok(state)
    }

    async fn apply_mutation(&self, mutation: StateMutation) -> Result<bool, AdapterError> {
        let mutation = mutation.normalized().map_err(|unsupported| {
            AdapterError::Unsupported(format!("cannot write arbitrary field: {unsupported:?}"))
        })?;
        match mutation {
            StateMutation::Balance { address, value } => {
                self.call_override("setBalance", json!([address, format_quantity(value)])).await
            }
            StateMutation::Nonce { address, nonce } => {
                self.call_override("setNonce", json!([address, hex_u64(nonce)])).await
            }
            StateMutation::Code { address, code } => {
                self.call_override("setCode", json!([address, code])).await
            }
            StateMutation::Storage { address, slot, value } => {
                self.call_override(
                    "setStorageAt",
                    json!([address, format_quantity(slot), format_word(value)]),
                )
                .await
            }
            StateMutation::Set { .. } => {
                Err(AdapterError::Unsupported("set on a non-standard account field".into()))
            }
        }
    }

    async fn wait_for_receipt(&self, hash: B256) -> Result<Value, AdapterError> {
        for attempt in 1..=RECEIPT_MAX_ATTEMPTS {
            let receipt = self.client.request_value("eth_getTransactionReceipt", json!([hash])).await?;
            if !receipt.is_null() {
                return Ok(receipt);
            }
            debug!(%hash, attempt, "receipt not available yet");
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
        Err(AdapterError::Timeout {
            operation: format!("receipt of {hash}"),
            elapsed: RECEIPT_POLL_INTERVAL * RECEIPT_MAX_ATTEMPTS,
        })
    }
}

#[async_trait]
impl VmAdapter for RpcNodeAdapter {
    fn backend(&self) -> &str {
        &self.tag
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn initialize(&mut self) -> Result<(), AdapterError> {
        let head: U256 = self.client.request("eth_blockNumber", json!([])).await?;
        info!(url = self.client.url(), dialect = self.dialect.tag(), %head, "connected to node");
        self.ready = true;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), AdapterError> {
        self.ready = false;
        Ok(())
    }

    async fn block_number(&self) -> Result<u64, AdapterError> {
        self.ensure_ready()?;
        let head: U256 = self.client.request("eth_blockNumber", json!([])).await?;
        u64::try_from(head).map_err(|_| AdapterError::Decode(format!("head {head} exceeds u64")))
    }

    async fn load_block_range(&self, start: u64, end: u64) -> Result<Vec<Block>, AdapterError> {
        self.ensure_ready()?;
        let mut blocks = Vec::new();
        for number in start..=end {
            let value = self
                .client
                .request_value("eth_getBlockByNumber", json!([hex_u64(number), true]))
                .await?;
            if value.is_null() {
                return Err(AdapterError::MissingData(format!("block {number}")));
            }
            blocks.push(block_from_rpc(&value)?);
        }
        Ok(blocks)
    }

    async fn load_transaction(&self, hash: B256) -> Result<Option<Transaction>, AdapterError> {
        self.ensure_ready()?;
        let value = self.client.request_value("eth_getTransactionByHash", json!([hash])).await?;
        if value.is_null() {
            return Ok(None);
        }
        transaction_from_rpc(&value).map(Some)
    }

    async fn get_state_at_block(
        &self,
        number: u64,
        query: &StateQuery,
    ) -> Result<State, AdapterError> {
        self.ensure_ready()?;
        let guard = if self.dialect.has_evm_namespace() {
            Some(self.create_snapshot().await?)
        } else {
            None
        };

        let state = self.read_state(&hex_u64(number), query).await;

        if let Some(guard) = guard {
            if !self.restore_snapshot(&guard).await? {
                warn!(handle = %guard, "backend refused to revert after historical read");
            }
        }
        state
    }

    async fn capture_state(&self, query: &StateQuery) -> Result<State, AdapterError> {
        self.ensure_ready()?;
        self.read_state("latest", query).await
    }

    async fn load_state(&self, state: &State) -> Result<(), AdapterError> {
        self.ensure_ready()?;
        for address in state.addresses() {
            let target = json!(format_address(&address));
            self.call_override("setBalance", json!([target, format_quantity(state.balance(&address))]))
                .await?;
            self.call_override("setNonce", json!([target, hex_u64(state.nonce(&address))])).await?;
            self.call_override("setCode", json!([target, state.code(&address)])).await?;
            for (slot, word) in state.storage_entries(&address) {
                self.call_override(
                    "setStorageAt",
                    json!([target, format_quantity(slot), format_word(word)]),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn apply_state_patch(&self, operation: &PatchOperation) -> Result<bool, AdapterError> {
        self.ensure_ready()?;
        let mutation = operation.to_mutation().map_err(AdapterError::Decode)?;
        self.apply_mutation(mutation).await
    }

    async fn create_snapshot(&self) -> Result<SnapshotHandle, AdapterError> {
        self.ensure_ready()?;
        if !self.dialect.has_evm_namespace() {
            return Err(AdapterError::Unsupported("evm_snapshot".into()));
        }
        let handle: Value = self.client.request_value("evm_snapshot", json!([])).await?;
        match handle {
            Value::String(id) => Ok(SnapshotHandle(id)),
            Value::Number(id) => Ok(SnapshotHandle(id.to_string())),
            other => Err(AdapterError::Decode(format!("evm_snapshot returned {other}"))),
        }
    }

    async fn restore_snapshot(&self, handle: &SnapshotHandle) -> Result<bool, AdapterError> {
        self.ensure_ready()?;
        if !self.dialect.has_evm_namespace() {
            return Err(AdapterError::Unsupported("evm_revert".into()));
        }
        self.client.request("evm_revert", json!([handle.0])).await
    }

    async fn execute_transaction(
        &self,
        tx: &TransactionRequest,
    ) -> Result<ExecutionOutcome, AdapterError> {
        self.ensure_ready()?;
        let impersonating = self.dialect.override_prefix().is_some();
        if impersonating {
            self.call_override("impersonateAccount", json!([tx.from])).await?;
        }

        let sent: Result<B256, AdapterError> =
            self.client.request("eth_sendTransaction", json!([request_to_rpc(tx)])).await;

        if impersonating {
            if let Err(e) = self.call_override("stopImpersonatingAccount", json!([tx.from])).await {
                warn!(from = %tx.from, "failed to stop impersonating: {e}");
            }
        }
        let hash = sent?;

        if self.dialect.has_evm_namespace() {
            self.client.request_value("evm_mine", json!([])).await?;
        }

        let receipt = self.wait_for_receipt(hash).await?;
        let block_number = receipt
            .get("blockNumber")
            .and_then(rewind_common::parse_u64)
            .ok_or_else(|| AdapterError::Decode("receipt has no blockNumber".into()))?;
        info!(%hash, block_number, "transaction mined");
        Ok(ExecutionOutcome { hash, receipt, block_number })
    }

    async fn trace_transaction(&self, hash: B256) -> Result<CallTrace, AdapterError> {
        self.ensure_ready()?;
        let frame = self
            .client
            .request_value("debug_traceTransaction", json!([hash, {"tracer": "callTracer"}]))
            .await?;
        call_trace_from_rpc(&frame)
    }

    fn stream_events(&self, start: u64, end: Option<u64>) -> EventStream {
        let source = RpcEventSource { client: self.client.clone() };
        EventStream::new(Arc::new(source), start, end).with_poll_interval(self.poll_interval)
    }

    async fn get_gas_estimates(
        &self,
        txs: &[TransactionRequest],
    ) -> Result<Vec<GasEstimate>, AdapterError> {
        self.ensure_ready()?;
        let mut estimates = Vec::with_capacity(txs.len());
        for (index, tx) in txs.iter().enumerate() {
            let estimate: Result<U256, _> =
                self.client.request("eth_estimateGas", json!([request_to_rpc(tx)])).await;
            estimates.push(match estimate {
                Ok(gas) => GasEstimate::ok(index, u64::try_from(gas).unwrap_or(u64::MAX)),
                Err(e) => GasEstimate::err(index, e.to_string()),
            });
        }
        Ok(estimates)
    }
}

/// [`EventSource`] reading blocks and logs over JSON-RPC.
#[derive(Debug, Clone)]
pub struct RpcEventSource {
    client: RpcClient,
}

impl RpcEventSource {
    /// Source over `client`.
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn head(&self) -> Result<u64, AdapterError> {
        let head: U256 = self.client.request("eth_blockNumber", json!([])).await?;
        u64::try_from(head).map_err(|_| AdapterError::Decode(format!("head {head} exceeds u64")))
    }

    async fn block_events(
        &self,
        number: u64,
    ) -> Result<Vec<rewind_common::TimelineEvent>, AdapterError> {
        let tag = hex_u64(number);
        let value =
            self.client.request_value("eth_getBlockByNumber", json!([tag, true])).await?;
        if value.is_null() {
            return Err(AdapterError::MissingData(format!("block {number}")));
        }
        let mut events = block_events(&block_from_rpc(&value)?);

        let logs = self
            .client
            .request_value("eth_getLogs", json!([{"fromBlock": tag, "toBlock": tag}]))
            .await?;
        for log in logs.as_array().map(Vec::as_slice).unwrap_or_default() {
            events.push(log_event_from_rpc(log, number)?);
        }
        Ok(events)
    }
}

/// Accounts touched by the transactions of `blocks`.
pub fn touched_accounts(blocks: &[Block]) -> Vec<Address> {
    let mut accounts: Vec<Address> = blocks
        .iter()
        .flat_map(|block| &block.transactions)
        .flat_map(|tx| [Some(tx.from), tx.to])
        .flatten()
        .collect();
    accounts.sort();
    accounts.dedup();
    accounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::logging::ensure_test_logging;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    async fn respond(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": rpc_method})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result})),
            )
            .mount(server)
            .await;
    }

    async fn ready_adapter(server: &MockServer, dialect: NodeDialect) -> RpcNodeAdapter {
        respond(server, "eth_blockNumber", json!("0x64")).await;
        let mut adapter = RpcNodeAdapter::connect(server.uri(), dialect);
        adapter.initialize().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_calls_before_initialize_fail() {
        ensure_test_logging(None);
        let adapter = RpcNodeAdapter::connect("http://127.0.0.1:1", NodeDialect::Anvil);
        assert!(matches!(adapter.block_number().await, Err(AdapterError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_balance_patch_uses_dialect_prefix() {
        ensure_test_logging(None);
        let server = MockServer::start().await;
        let adapter = ready_adapter(&server, NodeDialect::Hardhat).await;
        respond(&server, "hardhat_setBalance", Value::Null).await;

        let op = PatchOperation::balance(&Address::repeat_byte(0xaa), U256::from(1u64));
        assert!(adapter.apply_state_patch(&op).await.unwrap());
    }

    #[tokio::test]
    async fn test_geth_has_no_overrides() {
        ensure_test_logging(None);
        let server = MockServer::start().await;
        let adapter = ready_adapter(&server, NodeDialect::Geth).await;

        let op = PatchOperation::balance(&Address::repeat_byte(0xaa), U256::from(1u64));
        let err = adapter.apply_state_patch(&op).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unsupported(_)));
        assert!(matches!(adapter.create_snapshot().await, Err(AdapterError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_state_at_block_reverts_backend_snapshot() {
        ensure_test_logging(None);
        let server = MockServer::start().await;
        let adapter = ready_adapter(&server, NodeDialect::Anvil).await;
        respond(&server, "evm_snapshot", json!("0x1")).await;
        respond(&server, "evm_revert", json!(true)).await;
        respond(
            &server,
            "eth_getBlockByNumber",
            json!({
                "number": "0x63",
                "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                "timestamp": "0x10",
                "gasUsed": "0x0",
                "transactions": []
            }),
        )
        .await;
        respond(&server, "eth_getLogs", json!([])).await;
        respond(&server, "eth_getBalance", json!("0x5")).await;
        respond(&server, "eth_getTransactionCount", json!("0x2")).await;
        respond(&server, "eth_getCode", json!("0x")).await;

        let who = Address::repeat_byte(0xaa);
        let state =
            adapter.get_state_at_block(99, &StateQuery::for_accounts([who])).await.unwrap();
        assert_eq!(state.block_number(), Some(99));
        assert_eq!(state.balance(&who), U256::from(5u64));
        assert_eq!(state.nonce(&who), 2);

        let requests = server.received_requests().await.unwrap();
        let methods: Vec<String> = requests
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .filter_map(|body| body["method"].as_str().map(str::to_string))
            .collect();
        let snapshot_at = methods.iter().position(|m| m == "evm_snapshot").unwrap();
        let revert_at = methods.iter().position(|m| m == "evm_revert").unwrap();
        assert!(snapshot_at < revert_at);
        assert_eq!(methods.last().map(String::as_str), Some("evm_revert"));
    }

    #[tokio::test]
    async fn test_gas_estimates_capture_per_item_errors() {
        ensure_test_logging(None);
        let server = MockServer::start().await;
        let adapter = ready_adapter(&server, NodeDialect::Anvil).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_estimateGas", "params": [{"value": "0x0"}]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x5208"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_estimateGas", "params": [{"value": "0x1"}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": 3, "message": "execution reverted"}
            })))
            .mount(&server)
            .await;

        let txs = vec![
            TransactionRequest::default(),
            TransactionRequest { value: U256::from(1u64), ..Default::default() },
        ];
        let estimates = adapter.get_gas_estimates(&txs).await.unwrap();
        assert_eq!(estimates[0].estimate, Some(21_000));
        assert!(estimates[1].error.as_deref().unwrap().contains("execution reverted"));
    }

    #[test]
    fn test_touched_accounts_dedups() {
        let tx = Transaction {
            hash: B256::ZERO,
            block_number: Some(1),
            transaction_index: Some(0),
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            value: U256::ZERO,
            input: Default::default(),
            nonce: 0,
            gas: 21_000,
        };
        let block = Block {
            number: 1,
            hash: B256::ZERO,
            parent_hash: B256::ZERO,
            timestamp: 0,
            gas_used: 0,
            gas_limit: 0,
            transactions: vec![tx.clone(), tx],
        };
        assert_eq!(touched_accounts(&[block]).len(), 2);
    }
}
