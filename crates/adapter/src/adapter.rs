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

//! The VM adapter capability contract.
//!
//! Jobs and the patch engine talk to execution backends only through [`VmAdapter`].
//! A fresh instance is created per unit of work through an [`AdapterFactory`].

use alloy_primitives::B256;
use async_trait::async_trait;
use rewind_common::{
    AdapterError, Block, CallTrace, ExecutionOutcome, GasEstimate, PatchOperation, SnapshotHandle,
    State, StateQuery, Transaction, TransactionRequest,
};

use crate::EventStream;

/// Uniform capability set over an EVM execution backend.
///
/// Every operation maps onto one or a few JSON-RPC calls of the backend. Implementations
/// are not expected to tolerate concurrent mutation from several jobs; the controller
/// creates one instance per job through an [`AdapterFactory`].
#[async_trait]
pub trait VmAdapter: Send + Sync {
    /// Tag the adapter was registered under.
    fn backend(&self) -> &str;

    /// Whether [`initialize`](Self::initialize) succeeded and [`cleanup`](Self::cleanup)
    /// has not run since.
    fn is_ready(&self) -> bool;

    /// Acquires the backend: spawns the process or checks the connection.
    async fn initialize(&mut self) -> Result<(), AdapterError>;

    /// Releases everything [`initialize`](Self::initialize) acquired. Safe to call twice.
    async fn cleanup(&mut self) -> Result<(), AdapterError>;

    /// Current head block number.
    async fn block_number(&self) -> Result<u64, AdapterError>;

    /// Loads blocks `start..=end` with full transactions.
    async fn load_block_range(&self, start: u64, end: u64) -> Result<Vec<Block>, AdapterError>;

    /// Loads a transaction; `None` when the backend does not know it.
    async fn load_transaction(&self, hash: B256) -> Result<Option<Transaction>, AdapterError>;

    /// Reads `query` as of block `number` without moving the backend head.
    async fn get_state_at_block(
        &self,
        number: u64,
        query: &StateQuery,
    ) -> Result<State, AdapterError>;

    /// Reads `query` at the current head.
    async fn capture_state(&self, query: &StateQuery) -> Result<State, AdapterError>;

    /// Writes every account of `state` into the backend.
    async fn load_state(&self, state: &State) -> Result<(), AdapterError>;

    /// Applies a single operation. `Ok(false)` and `Err` both mean nothing changed.
    async fn apply_state_patch(&self, operation: &PatchOperation) -> Result<bool, AdapterError>;

    /// Takes a backend-side snapshot of the whole state.
    async fn create_snapshot(&self) -> Result<SnapshotHandle, AdapterError>;

    /// Reverts to a handle returned by [`create_snapshot`](Self::create_snapshot).
    async fn restore_snapshot(&self, handle: &SnapshotHandle) -> Result<bool, AdapterError>;

    /// Submits a transaction and forces its inclusion.
    async fn execute_transaction(
        &self,
        tx: &TransactionRequest,
    ) -> Result<ExecutionOutcome, AdapterError>;

    /// Call tree of a mined transaction.
    async fn trace_transaction(&self, hash: B256) -> Result<CallTrace, AdapterError>;

    /// Lazy timeline from `start`; unbounded when `end` is `None`.
    fn stream_events(&self, start: u64, end: Option<u64>) -> EventStream;

    /// Gas estimate per transaction; failures are reported per item.
    async fn get_gas_estimates(
        &self,
        txs: &[TransactionRequest],
    ) -> Result<Vec<GasEstimate>, AdapterError>;
}

/// Creates fresh adapter instances for a backend tag.
///
/// Any `Fn() -> Box<dyn VmAdapter>` closure is a factory.
pub trait AdapterFactory: Send + Sync {
    /// A new, uninitialized adapter.
    fn create(&self) -> Box<dyn VmAdapter>;
}

impl<F> AdapterFactory for F
where
    F: Fn() -> Box<dyn VmAdapter> + Send + Sync,
{
    fn create(&self) -> Box<dyn VmAdapter> {
        self()
    }
}
