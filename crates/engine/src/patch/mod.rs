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

//! State patches: validation, macro expansion and atomic application.
//!
//! A patch is applied against a VM adapter seeded with the source branch state. The
//! adapter is snapshotted before the first operation; any rejected or failing operation
//! reverts to that guard and the whole patch fails with a conflict. Only a fully applied
//! patch produces a snapshot and a child branch.

mod condition;
mod macros;
mod validate;

pub use condition::*;
pub use macros::*;
pub use validate::*;

use std::sync::Arc;

use rewind_adapter::VmAdapter;
use rewind_common::{
    Branch, CreateBranch, OpType, Patch, PatchOperation, Result, SnapshotHandle, State,
    StateMutation, StateQuery, TimeMachineError, ValidationReport,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{BranchManager, SnapshotStore};

/// Result of applying operations to an adapter.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    /// The patched state
    pub state: State,
    /// Operations skipped because their condition did not hold
    pub skipped: Vec<String>,
    /// Backend snapshot of the patched state
    pub handle: SnapshotHandle,
}

/// Applies patches to branches.
#[derive(Debug)]
pub struct PatchEngine {
    macros: MacroRegistry,
    store: Arc<SnapshotStore>,
    branches: Arc<BranchManager>,
}

impl PatchEngine {
    /// Engine writing into `store` and `branches`, with the builtin macros registered.
    pub fn new(store: Arc<SnapshotStore>, branches: Arc<BranchManager>) -> Self {
        Self { macros: MacroRegistry::new(), store, branches }
    }

    /// Macro registry.
    pub fn macros(&self) -> &MacroRegistry {
        &self.macros
    }

    /// Registers a user macro.
    pub fn register_macro(&self, template: MacroTemplate) -> Result<()> {
        self.macros.register(template)
    }

    /// Expands a macro into a standalone patch.
    pub fn expand_macro(&self, name: &str, params: &Value) -> Result<Patch> {
        self.macros.expand(name, params)
    }

    /// Validates a patch without applying it.
    pub fn validate(&self, patch: &Patch) -> ValidationReport {
        validate_patch(patch, &self.macros)
    }

    /// Replaces every `macro` operation by its expansion.
    pub fn expand(&self, patch: &Patch) -> Result<Patch> {
        let mut operations = Vec::with_capacity(patch.operations.len());
        for op in &patch.operations {
            if op.op_type == OpType::Macro {
                let name = op.key.as_deref().unwrap_or_default();
                operations.extend(self.macros.expand(name, &op.value)?.operations);
            } else {
                operations.push(op.clone());
            }
        }
        Ok(Patch { operations, ..patch.clone() })
    }

    /// Validates and expands, failing on the first report with errors.
    pub fn prepare(&self, patch: &Patch) -> Result<Patch> {
        let report = self.validate(patch);
        if !report.valid {
            return Err(TimeMachineError::validation(format!(
                "patch '{}' is invalid: {}",
                patch.name,
                report.errors.join("; ")
            )));
        }
        for warning in &report.warnings {
            warn!(patch = %patch.name, "{warning}");
        }
        self.expand(patch)
    }

    /// Applies `patch` on top of `source`, producing a child branch.
    ///
    /// `adapter` must be initialized. On any failure no snapshot and no branch remain.
    pub async fn apply(
        &self,
        adapter: &dyn VmAdapter,
        source: &Branch,
        patch: &Patch,
    ) -> Result<Branch> {
        let expanded = self.prepare(patch)?;
        let base = self.store.get(&source.snapshot_id)?;
        let outcome = apply_operations(adapter, &base, &expanded.operations).await?;

        let put = self.store.put_child(&source.snapshot_id, &outcome.state, source.block_number)?;
        let mut patches = source.patches_applied.clone();
        patches.push(patch.id.clone());

        let mut request = CreateBranch::new(
            format!("{}+{}", source.name, patch.name),
            put.id,
            source.block_number,
        )
        .with_parent(source.id.clone())
        .with_patches(patches)
        .with_tag("patched")
        .with_metadata("patch_name", json!(patch.name))
        .with_metadata("backend", json!(adapter.backend()))
        .with_metadata("backend_snapshot", json!(outcome.handle.0));
        if !outcome.skipped.is_empty() {
            request = request.with_metadata("skipped_operations", json!(outcome.skipped));
        }
        request.tx_index = source.tx_index;

        match self.branches.create(request) {
            Ok(branch) => {
                info!(
                    patch = %patch.name,
                    source = %source.id,
                    branch = %branch.id,
                    operations = expanded.operations.len(),
                    skipped = outcome.skipped.len(),
                    "applied patch"
                );
                Ok(branch)
            }
            Err(err) => {
                if put.inserted {
                    if let Err(e) = self.store.delete(&put.id) {
                        warn!(id = %put.id, error = %e, "rollback delete failed");
                    }
                }
                Err(err)
            }
        }
    }
}

/// Applies already expanded `operations` to `adapter`, seeded with `base`.
///
/// Conditions are evaluated against `base`. A rejected or failing operation yields
/// [`TimeMachineError::Conflict`]. Any error after seeding reverts the adapter to its
/// pre-patch snapshot.
pub async fn apply_operations(
    adapter: &dyn VmAdapter,
    base: &State,
    operations: &[PatchOperation],
) -> Result<PatchOutcome> {
    adapter.load_state(base).await?;
    let guard = adapter.create_snapshot().await?;
    match apply_guarded(adapter, base, operations).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            revert(adapter, &guard).await;
            Err(err)
        }
    }
}

async fn apply_guarded(
    adapter: &dyn VmAdapter,
    base: &State,
    operations: &[PatchOperation],
) -> Result<PatchOutcome> {
    let mut skipped = Vec::new();
    let mut local = Vec::new();
    let mut query = query_of(base);

    for (index, op) in operations.iter().enumerate() {
        let mutation = op.to_mutation().map_err(|err| {
            TimeMachineError::validation(format!("operation {index}: {err}"))
        })?;

        if let Some(expr) = &op.condition {
            let condition: Condition = expr.parse().map_err(|err: String| {
                TimeMachineError::validation(format!("operation {index}: {err}"))
            })?;
            if !condition.holds(base, mutation.address()) {
                debug!(index, condition = %condition, "condition does not hold, skipping");
                skipped.push(format!(
                    "operation {index} ({} {}): {condition}",
                    op.op_type, op.target_address
                ));
                continue;
            }
        }

        query.add_account(*mutation.address());

        // Fields without a backend setter are only written to the resulting tree.
        let mutation = match mutation.normalized() {
            Ok(typed) => typed,
            Err(custom) => {
                local.push(custom);
                continue;
            }
        };
        if let StateMutation::Storage { address, slot, .. } = &mutation {
            query.add_slot(*address, *slot);
        }

        let target = format!("operation {index} ({} {})", op.op_type, op.target_address);
        let failure = match adapter.apply_state_patch(op).await {
            Ok(true) => continue,
            Ok(false) => format!("{target} was rejected"),
            Err(err) => format!("{target} failed: {err}"),
        };
        return Err(TimeMachineError::Conflict(failure));
    }

    let captured = adapter.capture_state(&query).await?;

    let mut state = base.clone();
    for address in captured.addresses() {
        state.set_balance(&address, captured.balance(&address));
        state.set_nonce(&address, captured.nonce(&address));
        state.set_code(&address, &captured.code(&address));
        for (slot, word) in captured.storage_entries(&address) {
            state.set_storage(&address, slot, word);
        }
    }
    for mutation in &local {
        mutation.apply_to(&mut state);
    }

    let handle = adapter.create_snapshot().await?;
    Ok(PatchOutcome { state, skipped, handle })
}

async fn revert(adapter: &dyn VmAdapter, guard: &SnapshotHandle) {
    match adapter.restore_snapshot(guard).await {
        Ok(true) => debug!(handle = %guard, "reverted backend to pre-patch snapshot"),
        Ok(false) => warn!(handle = %guard, "backend refused to revert pre-patch snapshot"),
        Err(err) => warn!(handle = %guard, error = %err, "failed to revert pre-patch snapshot"),
    }
}

/// Accounts and slots already present in `state`.
fn query_of(state: &State) -> StateQuery {
    let mut query = StateQuery::for_accounts(state.addresses());
    for address in state.addresses() {
        for (slot, _) in state.storage_entries(&address) {
            query.add_slot(address, slot);
        }
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};
    use rewind_adapter::{MockChainAdapter, MockChainConfig};
    use rewind_common::{
        logging::ensure_test_logging,
        test_utils::{sample_state, ALICE, BOB, VAULT},
    };

    struct Fixture {
        engine: PatchEngine,
        store: Arc<SnapshotStore>,
        branches: Arc<BranchManager>,
        root: Branch,
    }

    fn fixture() -> Fixture {
        ensure_test_logging(None);
        let store = Arc::new(SnapshotStore::in_memory());
        let branches = Arc::new(BranchManager::new(store.clone()));
        let id = store.put(&sample_state(100), 100).unwrap().id;
        let root = branches.create(CreateBranch::new("root", id, 100)).unwrap();
        Fixture { engine: PatchEngine::new(store.clone(), branches.clone()), store, branches, root }
    }

    async fn adapter(config: MockChainConfig) -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new(config);
        adapter.initialize().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_apply_creates_child_branch() {
        let fx = fixture();
        let adapter = adapter(MockChainConfig::default()).await;
        let patch = Patch::new("drain")
            .with_operation(PatchOperation::balance(&ALICE, U256::from(1u64)))
            .with_operation(PatchOperation::storage(&VAULT, U256::ZERO, U256::from(9u64)));

        let child = fx.engine.apply(&adapter, &fx.root, &patch).await.unwrap();
        assert_eq!(child.parent_branch_id.as_ref(), Some(&fx.root.id));
        assert_eq!(child.patches_applied, vec![patch.id.clone()]);
        assert_eq!(child.name, "root+drain");

        let state = fx.store.get(&child.snapshot_id).unwrap();
        assert_eq!(state.balance(&ALICE), U256::from(1u64));
        assert_eq!(state.balance(&BOB), U256::ZERO);
        assert_eq!(state.storage(&VAULT, U256::ZERO), U256::from(9u64));
        assert_eq!(state.block_number(), Some(100));
        // The source snapshot is untouched.
        assert_eq!(fx.store.get(&fx.root.snapshot_id).unwrap(), sample_state(100));
    }

    #[tokio::test]
    async fn test_rejected_operation_persists_nothing() {
        let fx = fixture();
        let adapter = adapter(MockChainConfig::default().reject_patches_for(BOB)).await;
        let patch = Patch::new("half")
            .with_operation(PatchOperation::balance(&ALICE, U256::from(5u64)))
            .with_operation(PatchOperation::balance(&BOB, U256::from(5u64)));

        let err = fx.engine.apply(&adapter, &fx.root, &patch).await.unwrap_err();
        assert!(matches!(err, TimeMachineError::Conflict(_)), "{err}");
        assert_eq!(fx.store.len(), 1);
        assert_eq!(fx.branches.len(), 1);

        // The backend was reverted to the seeded state.
        let query = StateQuery::for_accounts([ALICE]);
        let seeded = adapter.capture_state(&query).await.unwrap();
        assert_eq!(seeded.balance(&ALICE), U256::from(1000u64));
    }

    #[tokio::test]
    async fn test_malformed_operation_reverts_applied_ones() {
        ensure_test_logging(None);
        let adapter = adapter(MockChainConfig::default()).await;
        let base = sample_state(100);
        let mut broken = PatchOperation::nonce(&ALICE, 1);
        broken.value = json!("soon");
        let operations = [PatchOperation::balance(&ALICE, U256::from(5u64)), broken];

        let err = apply_operations(&adapter, &base, &operations).await.unwrap_err();
        assert!(matches!(err, TimeMachineError::Validation(_)), "{err}");
        let seeded = adapter.capture_state(&StateQuery::for_accounts([ALICE])).await.unwrap();
        assert_eq!(seeded.balance(&ALICE), base.balance(&ALICE));
    }

    #[tokio::test]
    async fn test_invalid_patch_is_rejected_before_backend() {
        let fx = fixture();
        let adapter = adapter(MockChainConfig::default()).await;
        let mut op = PatchOperation::nonce(&ALICE, 1);
        op.value = json!("soon");

        let err = fx.engine.apply(&adapter, &fx.root, &Patch::new("bad").with_operation(op)).await;
        assert!(matches!(err, Err(TimeMachineError::Validation(_))));
        assert_eq!(fx.branches.len(), 1);
    }

    #[tokio::test]
    async fn test_conditions_skip_operations() {
        let fx = fixture();
        let adapter = adapter(MockChainConfig::default()).await;
        let patch = Patch::new("guarded")
            .with_operation(
                PatchOperation::balance(&ALICE, U256::from(7u64)).with_condition("balance_gt:100"),
            )
            .with_operation(
                PatchOperation::balance(&BOB, U256::from(7u64)).with_condition("balance_gt:100"),
            );

        let child = fx.engine.apply(&adapter, &fx.root, &patch).await.unwrap();
        let state = fx.store.get(&child.snapshot_id).unwrap();
        assert_eq!(state.balance(&ALICE), U256::from(7u64));
        assert_eq!(state.balance(&BOB), U256::ZERO);
        assert_eq!(child.metadata["skipped_operations"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_macro_and_custom_field() {
        let fx = fixture();
        let adapter = adapter(MockChainConfig::default()).await;
        let fresh = Address::repeat_byte(0x42);
        let patch = Patch::new("setup")
            .with_operation(PatchOperation::macro_call(
                "fund_account",
                json!({"address": rewind_common::format_address(&fresh), "amount": "0x64"}),
            ))
            .with_operation(PatchOperation::set(&VAULT, "labels.role", json!("victim")));

        let child = fx.engine.apply(&adapter, &fx.root, &patch).await.unwrap();
        let state = fx.store.get(&child.snapshot_id).unwrap();
        assert_eq!(state.balance(&fresh), U256::from(100u64));
        assert_eq!(state.account(&VAULT).unwrap()["labels"]["role"], json!("victim"));
    }

    #[tokio::test]
    async fn test_patches_accumulate_along_lineage() {
        let fx = fixture();
        let adapter = adapter(MockChainConfig::default()).await;
        let first = Patch::new("one").with_operation(PatchOperation::nonce(&ALICE, 1));
        let second = Patch::new("two").with_operation(PatchOperation::nonce(&ALICE, 2));

        let child = fx.engine.apply(&adapter, &fx.root, &first).await.unwrap();
        let grandchild = fx.engine.apply(&adapter, &child, &second).await.unwrap();
        assert_eq!(grandchild.patches_applied, vec![first.id, second.id]);
        assert_eq!(fx.store.get(&grandchild.snapshot_id).unwrap().nonce(&ALICE), 2);
    }
}
