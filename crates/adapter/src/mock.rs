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

//! Deterministic in-memory chain.
//!
//! [`MockChainAdapter`] builds a short chain from a [`MockChainConfig`]: every block
//! carries one transfer between the configured accounts and one `Transfer` log from the
//! contract account, whose storage slot 1 counts mined blocks. Two adapters built from
//! the same config observe byte-identical states, which makes it the backend of choice
//! for tests and dry runs. Failures can be injected per block.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use rewind_common::{
    format_address, format_word, AdapterError, Block, CallTrace, ExecutionOutcome, GasEstimate,
    PatchOperation, SnapshotHandle, State, StateQuery, TimelineEvent, Transaction,
    TransactionRequest,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    convert::{block_events, hex_u64, log_event_from_rpc},
    EventSource, EventStream, VmAdapter,
};

/// Gas charged per mock transaction.
pub const MOCK_TX_GAS: u64 = 21_000;
/// Timestamp of block 0.
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
/// Seconds between blocks.
const BLOCK_INTERVAL: u64 = 12;
/// Slot of the contract's block counter.
const COUNTER_SLOT: u64 = 1;

/// Counts adapter lifecycle calls across every adapter built from one config.
#[derive(Debug, Default)]
pub struct MockLifecycle {
    initialized: AtomicUsize,
    cleaned_up: AtomicUsize,
}

impl MockLifecycle {
    /// Successful `initialize` calls.
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    /// `cleanup` calls.
    pub fn cleaned_up(&self) -> usize {
        self.cleaned_up.load(Ordering::SeqCst)
    }
}

/// Shape of the mock chain and its injected failures.
#[derive(Debug, Clone)]
pub struct MockChainConfig {
    /// First mined block
    pub start_block: u64,
    /// Number of mined blocks
    pub block_count: u64,
    /// Externally owned accounts; transfers rotate through them
    pub accounts: Vec<Address>,
    /// Contract account emitting logs and counting blocks
    pub contract: Address,
    /// Starting balance of every account
    pub initial_balance: U256,
    /// Blocks whose state reads fail with an RPC error
    pub fail_on_blocks: Vec<u64>,
    /// Accounts whose patches are refused
    pub reject_patches_for: Vec<Address>,
    /// Whether `initialize` fails
    pub fail_on_initialize: bool,
    /// Artificial latency of every state read
    pub latency: Duration,
    /// Event stream poll interval
    pub poll_interval: Duration,
    /// Shared lifecycle counters
    pub lifecycle: Arc<MockLifecycle>,
}

impl Default for MockChainConfig {
    fn default() -> Self {
        Self {
            start_block: 100,
            block_count: 3,
            accounts: vec![Address::repeat_byte(0x11), Address::repeat_byte(0x22)],
            contract: Address::repeat_byte(0x33),
            initial_balance: U256::from(1_000_000u64),
            fail_on_blocks: Vec::new(),
            reject_patches_for: Vec::new(),
            fail_on_initialize: false,
            latency: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            lifecycle: Arc::new(MockLifecycle::default()),
        }
    }
}

impl MockChainConfig {
    /// Sets the mined block range.
    pub fn with_blocks(mut self, start_block: u64, block_count: u64) -> Self {
        self.start_block = start_block;
        self.block_count = block_count;
        self
    }

    /// Makes state reads at `block` fail.
    pub fn fail_on_block(mut self, block: u64) -> Self {
        self.fail_on_blocks.push(block);
        self
    }

    /// Makes patches targeting `address` fail.
    pub fn reject_patches_for(mut self, address: Address) -> Self {
        self.reject_patches_for.push(address);
        self
    }

    /// Makes `initialize` fail.
    pub fn fail_on_initialize(mut self) -> Self {
        self.fail_on_initialize = true;
        self
    }

    /// Delays every state read.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every account of the chain, contract last.
    pub fn all_accounts(&self) -> Vec<Address> {
        let mut accounts = self.accounts.clone();
        accounts.push(self.contract);
        accounts
    }
}

#[derive(Debug)]
struct MockChain {
    blocks: BTreeMap<u64, Block>,
    states: BTreeMap<u64, State>,
    genesis: State,
    head: u64,
    world: State,
    snapshots: Vec<State>,
    receipts: BTreeMap<B256, Value>,
}

fn transfer_topic() -> B256 {
    keccak256("Transfer(address,address,uint256)")
}

fn log_json(contract: &Address, from: &Address, to: &Address, value: U256, tx: B256, number: u64) -> Value {
    json!({
        "address": format_address(contract),
        "topics": [transfer_topic(), B256::left_padding_from(from.as_slice()), B256::left_padding_from(to.as_slice())],
        "data": format_word(value),
        "blockNumber": hex_u64(number),
        "transactionHash": tx,
        "logIndex": "0x0",
    })
}

impl MockChain {
    fn build(config: &MockChainConfig) -> Self {
        let genesis_number = config.start_block.saturating_sub(1);
        let mut genesis = State::new();
        genesis.set_block_number(genesis_number);
        genesis.set_timestamp(GENESIS_TIMESTAMP + genesis_number * BLOCK_INTERVAL);
        genesis.set_gas_used(0);
        genesis.set_logs(Vec::new());
        for account in &config.accounts {
            genesis.set_balance(account, config.initial_balance);
        }
        genesis.set_code(&config.contract, &Bytes::from_static(&[0x60, 0x80, 0x60, 0x40, 0x52]));
        genesis.set_storage(&config.contract, U256::ZERO, U256::from(1u64));

        let mut chain = Self {
            blocks: BTreeMap::new(),
            states: BTreeMap::new(),
            genesis: genesis.clone(),
            head: genesis_number,
            world: genesis,
            snapshots: Vec::new(),
            receipts: BTreeMap::new(),
        };

        let accounts = &config.accounts;
        if accounts.is_empty() {
            return chain;
        }
        for offset in 0..config.block_count {
            let from = accounts[offset as usize % accounts.len()];
            let to = accounts[(offset as usize + 1) % accounts.len()];
            let request = TransactionRequest {
                from,
                to: Some(to),
                value: U256::from(100 * (offset + 1)),
                ..Default::default()
            };
            let tag = format!("mock-tx-{}", config.start_block + offset);
            // Preconfigured transfers always fit the initial balances.
            let _ = chain.mine(config, &request, keccak256(tag.as_bytes()));
        }
        chain
    }

    /// Executes `request` on the world state in a new block.
    fn mine(
        &mut self,
        config: &MockChainConfig,
        request: &TransactionRequest,
        hash: B256,
    ) -> Result<u64, AdapterError> {
        let balance = self.world.balance(&request.from);
        if balance < request.value {
            return Err(AdapterError::Rpc {
                code: -32003,
                message: format!("insufficient funds for transfer from {}", request.from),
            });
        }
        let number = self.head + 1;
        let nonce = self.world.nonce(&request.from);
        let to = request.to.unwrap_or(config.contract);

        self.world.set_balance(&request.from, balance - request.value);
        let receiving = self.world.balance(&to);
        self.world.set_balance(&to, receiving + request.value);
        self.world.set_nonce(&request.from, nonce + 1);
        let counter = self.world.storage(&config.contract, U256::from(COUNTER_SLOT));
        self.world.set_storage(&config.contract, U256::from(COUNTER_SLOT), counter + U256::from(1u64));

        let timestamp = GENESIS_TIMESTAMP + number * BLOCK_INTERVAL;
        self.world.set_block_number(number);
        self.world.set_timestamp(timestamp);
        self.world.set_gas_used(MOCK_TX_GAS);
        self.world.set_logs(vec![log_json(&config.contract, &request.from, &to, request.value, hash, number)]);

        let block_hash = keccak256(format!("mock-block-{number}").as_bytes());
        let parent_hash = self.blocks.get(&(number - 1)).map(|b| b.hash).unwrap_or_default();
        self.blocks.insert(
            number,
            Block {
                number,
                hash: block_hash,
                parent_hash,
                timestamp,
                gas_used: MOCK_TX_GAS,
                gas_limit: 30_000_000,
                transactions: vec![Transaction {
                    hash,
                    block_number: Some(number),
                    transaction_index: Some(0),
                    from: request.from,
                    to: Some(to),
                    value: request.value,
                    input: request.data.clone(),
                    nonce,
                    gas: request.gas.unwrap_or(MOCK_TX_GAS),
                }],
            },
        );
        self.states.insert(number, self.world.clone());
        self.receipts.insert(
            hash,
            json!({
                "transactionHash": hash,
                "blockNumber": hex_u64(number),
                "blockHash": block_hash,
                "status": "0x1",
                "gasUsed": hex_u64(MOCK_TX_GAS),
            }),
        );
        self.head = number;
        Ok(number)
    }

    fn state_at(&self, number: u64) -> Result<&State, AdapterError> {
        if number > self.head {
            return Err(AdapterError::MissingData(format!("block {number} is beyond head {}", self.head)));
        }
        Ok(self.states.get(&number).unwrap_or(&self.genesis))
    }

    fn find_transaction(&self, hash: B256) -> Option<&Transaction> {
        self.blocks.values().flat_map(|b| &b.transactions).find(|tx| tx.hash == hash)
    }
}

/// Copies the header and the queried accounts of `source`.
fn project(source: &State, query: &StateQuery) -> State {
    let mut state = State::new();
    if let Some(number) = source.block_number() {
        state.set_block_number(number);
    }
    if let Some(timestamp) = source.timestamp() {
        state.set_timestamp(timestamp);
    }
    state.set_gas_used(source.gas_used().unwrap_or_default());
    state.set_logs(source.logs().to_vec());
    for (address, slots) in &query.accounts {
        state.set_balance(address, source.balance(address));
        state.set_nonce(address, source.nonce(address));
        state.set_code(address, &source.code(address));
        for slot in slots {
            state.set_storage(address, *slot, source.storage(address, *slot));
        }
    }
    state
}

/// [`VmAdapter`] over a [`MockChainConfig`] chain.
#[derive(Debug)]
pub struct MockChainAdapter {
    tag: String,
    config: MockChainConfig,
    chain: Arc<Mutex<MockChain>>,
    ready: bool,
}

impl Default for MockChainAdapter {
    fn default() -> Self {
        Self::new(MockChainConfig::default())
    }
}

impl MockChainAdapter {
    /// Builds the chain described by `config`.
    pub fn new(config: MockChainConfig) -> Self {
        let chain = MockChain::build(&config);
        Self { tag: "mock".to_string(), config, chain: Arc::new(Mutex::new(chain)), ready: false }
    }

    /// Overrides the registry tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Chain configuration.
    pub fn config(&self) -> &MockChainConfig {
        &self.config
    }

    /// Hash of the transaction mined in `block`.
    pub fn transaction_hash(&self, block: u64) -> Option<B256> {
        self.chain.lock().blocks.get(&block).and_then(|b| b.transactions.first()).map(|tx| tx.hash)
    }

    fn ensure_ready(&self) -> Result<(), AdapterError> {
        if self.ready {
            Ok(())
        } else {
            Err(AdapterError::NotInitialized)
        }
    }
}

#[async_trait]
impl VmAdapter for MockChainAdapter {
    fn backend(&self) -> &str {
        &self.tag
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn initialize(&mut self) -> Result<(), AdapterError> {
        if self.config.fail_on_initialize {
            return Err(AdapterError::Process("mock backend refused to start".into()));
        }
        self.ready = true;
        self.config.lifecycle.initialized.fetch_add(1, Ordering::SeqCst);
        info!(backend = %self.tag, head = self.chain.lock().head, "mock chain ready");
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), AdapterError> {
        self.ready = false;
        self.config.lifecycle.cleaned_up.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn block_number(&self) -> Result<u64, AdapterError> {
        self.ensure_ready()?;
        Ok(self.chain.lock().head)
    }

    async fn load_block_range(&self, start: u64, end: u64) -> Result<Vec<Block>, AdapterError> {
        self.ensure_ready()?;
        let chain = self.chain.lock();
        (start..=end)
            .map(|number| {
                chain
                    .blocks
                    .get(&number)
                    .cloned()
                    .ok_or_else(|| AdapterError::MissingData(format!("block {number}")))
            })
            .collect()
    }

    async fn load_transaction(&self, hash: B256) -> Result<Option<Transaction>, AdapterError> {
        self.ensure_ready()?;
        Ok(self.chain.lock().find_transaction(hash).cloned())
    }

    async fn get_state_at_block(
        &self,
        number: u64,
        query: &StateQuery,
    ) -> Result<State, AdapterError> {
        self.ensure_ready()?;
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        if self.config.fail_on_blocks.contains(&number) {
            return Err(AdapterError::Rpc {
                code: -32000,
                message: format!("injected failure reading block {number}"),
            });
        }
        let chain = self.chain.lock();
        let state = project(chain.state_at(number)?, query);
        debug!(block = number, hash = %state.content_hash().short(), "mock state read");
        Ok(state)
    }

    async fn capture_state(&self, query: &StateQuery) -> Result<State, AdapterError> {
        self.ensure_ready()?;
        Ok(project(&self.chain.lock().world, query))
    }

    async fn load_state(&self, state: &State) -> Result<(), AdapterError> {
        self.ensure_ready()?;
        let mut chain = self.chain.lock();
        for address in state.addresses() {
            chain.world.set_balance(&address, state.balance(&address));
            chain.world.set_nonce(&address, state.nonce(&address));
            chain.world.set_code(&address, &state.code(&address));
            for (slot, word) in state.storage_entries(&address) {
                chain.world.set_storage(&address, slot, word);
            }
        }
        Ok(())
    }

    async fn apply_state_patch(&self, operation: &PatchOperation) -> Result<bool, AdapterError> {
        self.ensure_ready()?;
        let mutation = operation.to_mutation().map_err(AdapterError::Decode)?;
        if self.config.reject_patches_for.contains(mutation.address()) {
            debug!(address = %mutation.address(), "mock refused patch");
            return Ok(false);
        }
        mutation.apply_to(&mut self.chain.lock().world);
        Ok(true)
    }

    async fn create_snapshot(&self) -> Result<SnapshotHandle, AdapterError> {
        self.ensure_ready()?;
        let mut chain = self.chain.lock();
        let world = chain.world.clone();
        chain.snapshots.push(world);
        Ok(SnapshotHandle(hex_u64(chain.snapshots.len() as u64 - 1)))
    }

    async fn restore_snapshot(&self, handle: &SnapshotHandle) -> Result<bool, AdapterError> {
        self.ensure_ready()?;
        let Some(index) = rewind_common::parse_quantity_str(&handle.0)
            .and_then(|i| usize::try_from(i).ok())
        else {
            return Ok(false);
        };
        let mut chain = self.chain.lock();
        if index >= chain.snapshots.len() {
            return Ok(false);
        }
        // Reverting consumes the snapshot and every later one, like `evm_revert`.
        let restored = chain.snapshots[index].clone();
        chain.snapshots.truncate(index);
        chain.world = restored;
        Ok(true)
    }

    async fn execute_transaction(
        &self,
        tx: &TransactionRequest,
    ) -> Result<ExecutionOutcome, AdapterError> {
        self.ensure_ready()?;
        let mut chain = self.chain.lock();
        let tag = format!("mock-exec-{}-{}-{}", chain.head, tx.from, chain.world.nonce(&tx.from));
        let hash = keccak256(tag.as_bytes());
        let block_number = chain.mine(&self.config, tx, hash)?;
        let receipt = chain.receipts.get(&hash).cloned().unwrap_or(Value::Null);
        Ok(ExecutionOutcome { hash, receipt, block_number })
    }

    async fn trace_transaction(&self, hash: B256) -> Result<CallTrace, AdapterError> {
        self.ensure_ready()?;
        let chain = self.chain.lock();
        let tx = chain
            .find_transaction(hash)
            .ok_or_else(|| AdapterError::MissingData(format!("transaction {hash}")))?;
        Ok(CallTrace {
            call_type: "CALL".to_string(),
            from: tx.from,
            to: tx.to,
            value: Some(tx.value),
            gas_used: MOCK_TX_GAS,
            input: tx.input.clone(),
            output: Bytes::new(),
            error: None,
            calls: Vec::new(),
        })
    }

    fn stream_events(&self, start: u64, end: Option<u64>) -> EventStream {
        EventStream::new(Arc::new(MockEventSource { chain: self.chain.clone() }), start, end)
            .with_poll_interval(self.config.poll_interval)
    }

    async fn get_gas_estimates(
        &self,
        txs: &[TransactionRequest],
    ) -> Result<Vec<GasEstimate>, AdapterError> {
        self.ensure_ready()?;
        let chain = self.chain.lock();
        Ok(txs
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                if chain.world.balance(&tx.from) < tx.value {
                    GasEstimate::err(index, "insufficient funds for transfer")
                } else {
                    GasEstimate::ok(index, MOCK_TX_GAS + 16 * tx.data.len() as u64)
                }
            })
            .collect())
    }
}

struct MockEventSource {
    chain: Arc<Mutex<MockChain>>,
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn head(&self) -> Result<u64, AdapterError> {
        Ok(self.chain.lock().head)
    }

    async fn block_events(&self, number: u64) -> Result<Vec<TimelineEvent>, AdapterError> {
        let chain = self.chain.lock();
        let block =
            chain.blocks.get(&number).ok_or_else(|| AdapterError::MissingData(format!("block {number}")))?;
        let mut events = block_events(block);
        for log in chain.state_at(number)?.logs() {
            events.push(log_event_from_rpc(log, number)?);
        }
        Ok(events)
    }
}
