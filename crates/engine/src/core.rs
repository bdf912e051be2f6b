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

//! The time machine context.
//!
//! [`TimeMachine`] owns every engine component and is the single entry point of the
//! crate. It is built explicitly from an [`EngineConfig`] and torn down with
//! [`TimeMachine::shutdown`]; there is no global instance.
//!
//! # Components
//!
//! - [`SnapshotStore`] - content-addressed states, memory or disk backed
//! - [`BranchManager`] - lineage records over stored snapshots
//! - [`PatchEngine`] - validation, macro expansion and application of patches
//! - [`DiffEngine`] - cached branch-to-branch diffs and their renderers
//! - [`ReplayJobController`] - adapter registry and replay jobs
//! - [`SessionRegistry`] - investigator sessions
//!
//! # Persistence
//!
//! When the configuration names a data directory, snapshot blobs live under
//! `<data_dir>/snapshots/` and the lineage index under `<data_dir>/index.json`. The index
//! is rewritten after every operation that changes lineage and on [`TimeMachine::flush`];
//! [`TimeMachine::new`] reloads it.
//!
//! Every operation taking an id resolves it first and fails with a
//! [`TimeMachineError::NotFound`] before touching any backend.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use rewind_adapter::{AnvilAdapter, MockChainAdapter, MockChainConfig, RpcNodeAdapter, VmAdapter};
use rewind_common::{
    Branch, BranchFilter, BranchId, CreateBranch, CreateJob, Diff, DiffFormat, EntityKind,
    DataPath, ForensicSession, JobId, JobStatus, Patch, PatchOperation, ReplayJob, Result,
    SessionId, Severity, Snapshot, SnapshotId, State, StorageError, TimeMachineError,
    ValidationReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    render_as, BranchManager, DiffEngine, DiffOptions, DiskBlobBackend, EngineConfig, JobStats,
    MacroTemplate, MemoryBlobBackend, PatchEngine, ReplayJobController, SessionRegistry,
    SnapshotStore, StoreStats,
};

/// Version of the persisted lineage index layout.
const INDEX_VERSION: u32 = 1;

/// Persisted lineage: which snapshot each branch points at and how snapshots chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageIndex {
    /// Layout version
    pub version: u32,
    /// `branch_id → snapshot_id`
    pub branches: BTreeMap<BranchId, SnapshotId>,
    /// `snapshot_id → parent_snapshot_id`
    pub snapshots: BTreeMap<SnapshotId, Option<SnapshotId>>,
    /// Full branch records
    pub branch_records: Vec<Branch>,
    /// Full snapshot metadata
    pub snapshot_records: Vec<Snapshot>,
}

/// Outcome of a snapshot sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Snapshots examined
    pub scanned: usize,
    /// Snapshots kept because a branch, a live job or a kept delta needs them
    pub reachable: usize,
    /// Unreachable snapshots kept because they are younger than the cutoff
    pub recent: usize,
    /// Deleted snapshots
    pub deleted: Vec<SnapshotId>,
}

/// Aggregate numbers of every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Snapshot store
    pub store: StoreStats,
    /// Number of branches
    pub branches: usize,
    /// Branches without children
    pub tips: usize,
    /// Replay jobs
    pub jobs: JobStats,
    /// Cached diffs
    pub cached_diffs: usize,
    /// Registered patch macros
    pub macros: usize,
    /// Forensic sessions
    pub sessions: usize,
    /// Whether state is persisted
    pub persistent: bool,
}

/// Owner of every engine component.
#[derive(Debug)]
pub struct TimeMachine {
    config: EngineConfig,
    index_file: Option<PathBuf>,
    store: Arc<SnapshotStore>,
    branches: Arc<BranchManager>,
    patches: Arc<PatchEngine>,
    diffs: DiffEngine,
    controller: Arc<ReplayJobController>,
    sessions: SessionRegistry,
}

impl TimeMachine {
    /// Builds the engine, opening the data directory and reloading its lineage index
    /// when one is configured.
    ///
    /// Backends `mock`, `anvil` and every configured node are registered.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let data_path = config.data_path();
        let (backend, index_file) = match data_path.snapshots_dir() {
            Some(dir) => {
                let backend: Arc<dyn crate::BlobBackend> = Arc::new(DiskBlobBackend::new(dir)?);
                (backend, data_path.index_file())
            }
            None => {
                let backend: Arc<dyn crate::BlobBackend> = Arc::new(MemoryBlobBackend::new());
                (backend, None)
            }
        };
        let store = Arc::new(
            SnapshotStore::new(backend)
                .with_checkpoint_interval(config.checkpoint_interval)
                .with_compression_threshold(config.compression_threshold),
        );
        let branches = Arc::new(BranchManager::new(store.clone()));
        let patches = Arc::new(PatchEngine::new(store.clone(), branches.clone()));
        let diffs = DiffEngine::new(store.clone(), branches.clone());
        let controller = Arc::new(ReplayJobController::new(
            store.clone(),
            branches.clone(),
            patches.clone(),
            config.replay_timeout(),
        ));

        let machine = Self {
            config,
            index_file,
            store,
            branches,
            patches,
            diffs,
            controller,
            sessions: SessionRegistry::new(),
        };
        machine.register_default_adapters();
        machine.load_index()?;
        info!(
            persistent = machine.index_file.is_some(),
            snapshots = machine.store.len(),
            branches = machine.branches.len(),
            "time machine ready"
        );
        Ok(machine)
    }

    fn register_default_adapters(&self) {
        let poll_interval = self.config.event_poll_interval();
        self.controller.register_adapter(
            "mock",
            Arc::new(move || {
                let config = MockChainConfig { poll_interval, ..Default::default() };
                Box::new(MockChainAdapter::new(config)) as Box<dyn VmAdapter>
            }),
        );

        let anvil = self.config.anvil.clone();
        self.controller.register_adapter(
            "anvil",
            Arc::new(move || Box::new(AnvilAdapter::new(anvil.clone())) as Box<dyn VmAdapter>),
        );

        for node in &self.config.nodes {
            let endpoint = node.clone();
            self.controller.register_adapter(
                node.tag.clone(),
                Arc::new(move || {
                    let adapter = RpcNodeAdapter::connect(&endpoint.url, endpoint.dialect)
                        .with_tag(endpoint.tag.clone())
                        .with_poll_interval(poll_interval);
                    Box::new(adapter) as Box<dyn VmAdapter>
                }),
            );
        }
    }

    fn load_index(&self) -> Result<()> {
        let Some(path) = &self.index_file else { return Ok(()) };
        if !path.exists() {
            debug!("no lineage index at {}", path.display());
            return Ok(());
        }
        let bytes = fs::read(path).map_err(StorageError::from)?;
        let index: LineageIndex = serde_json::from_slice(&bytes).map_err(StorageError::from)?;
        if index.version != INDEX_VERSION {
            return Err(StorageError::UnsupportedIndexVersion {
                found: index.version,
                expected: INDEX_VERSION,
            }
            .into());
        }
        self.store.restore_index(index.snapshot_records);
        let restored = self.branches.restore(index.branch_records);
        info!("Restored {restored} branches from {}", path.display());
        Ok(())
    }

    /// Current lineage index.
    pub fn lineage_index(&self) -> LineageIndex {
        let branch_records = self.branches.list(&BranchFilter::default());
        let mut snapshot_records = self.store.list();
        snapshot_records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        LineageIndex {
            version: INDEX_VERSION,
            branches: branch_records.iter().map(|b| (b.id.clone(), b.snapshot_id)).collect(),
            snapshots: self.store.parent_links(),
            branch_records,
            snapshot_records,
        }
    }

    /// Writes the lineage index when persistence is configured.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.index_file else { return Ok(()) };
        let bytes = serde_json::to_vec_pretty(&self.lineage_index()).map_err(StorageError::from)?;
        // Atomic write via temp file
        let temp_file = path.with_extension("tmp");
        fs::write(&temp_file, bytes).map_err(StorageError::from)?;
        fs::rename(&temp_file, path).map_err(StorageError::from)?;
        debug!("wrote lineage index to {}", path.display());
        Ok(())
    }

    /// Cancels every unfinished job and writes the lineage index.
    pub fn shutdown(&self) -> Result<()> {
        for job in self.controller.list_jobs(None) {
            if !job.status.is_terminal() {
                self.controller.cancel(&job.id)?;
            }
        }
        self.flush()?;
        info!("time machine shut down");
        Ok(())
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot store.
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Branch manager.
    pub fn branches(&self) -> &Arc<BranchManager> {
        &self.branches
    }

    /// Replay job controller, for registering custom adapters.
    pub fn controller(&self) -> &Arc<ReplayJobController> {
        &self.controller
    }

    // ---------------------------------------------------------------- jobs

    /// Records a PENDING replay job.
    pub fn create_replay_job(&self, request: CreateJob) -> Result<ReplayJob> {
        self.controller.create_job(request)
    }

    /// Runs a job to completion on the current task.
    pub async fn run_replay_job(&self, id: &JobId) -> Result<ReplayJob> {
        let job = self.controller.run(id).await?;
        if job.status == JobStatus::Completed {
            self.flush()?;
        }
        Ok(job)
    }

    /// Runs a job on the tokio runtime.
    pub fn spawn_replay_job(&self, id: &JobId) -> Result<JoinHandle<Result<ReplayJob>>> {
        self.controller.get_job(id)?;
        Ok(self.controller.spawn(id.clone()))
    }

    /// Cancels a job that has not finished.
    pub fn cancel_replay_job(&self, id: &JobId) -> Result<ReplayJob> {
        self.controller.cancel(id)
    }

    /// Looks a job up.
    pub fn get_job(&self, id: &JobId) -> Result<ReplayJob> {
        self.controller.get_job(id)
    }

    /// Jobs in creation order.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<ReplayJob> {
        self.controller.list_jobs(status)
    }

    // ------------------------------------------------------------ branches

    /// Creates a branch over an already stored snapshot.
    pub fn create_branch(&self, request: CreateBranch) -> Result<Branch> {
        if !self.store.contains(&request.snapshot_id) {
            return Err(TimeMachineError::not_found(EntityKind::Snapshot, request.snapshot_id));
        }
        if let Some(parent) = &request.parent_branch_id {
            self.branches.get(parent)?;
        }
        let branch = self.branches.create(request)?;
        self.flush()?;
        Ok(branch)
    }

    /// Stores `state` and roots a new branch on it.
    pub fn import_state(
        &self,
        name: impl Into<String>,
        state: &State,
        block_number: u64,
    ) -> Result<Branch> {
        let put = self.store.put(state, block_number)?;
        let request = CreateBranch::new(name, put.id, block_number).with_tag("imported");
        match self.create_branch(request) {
            Ok(branch) => Ok(branch),
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

    /// Looks a branch up.
    pub fn get_branch(&self, id: &BranchId) -> Result<Branch> {
        self.branches.get(id)
    }

    /// State a branch points at.
    pub fn branch_state(&self, id: &BranchId) -> Result<State> {
        let branch = self.branches.get(id)?;
        self.store.get(&branch.snapshot_id)
    }

    /// Branches matching `filter`, in creation order.
    pub fn list_branches(&self, filter: &BranchFilter) -> Vec<Branch> {
        self.branches.list(filter)
    }

    /// Branch and its ancestors, nearest first.
    pub fn branch_ancestry(&self, id: &BranchId) -> Result<Vec<Branch>> {
        self.branches.ancestry(id)
    }

    // ------------------------------------------------------------- patches

    /// Applies `patch` on top of `branch` using the configured patch backend.
    pub async fn apply_patch(&self, branch: &BranchId, patch: &Patch) -> Result<Branch> {
        let backend = self.config.patch_backend.clone();
        self.apply_patch_with(&backend, branch, patch).await
    }

    /// Applies `patch` on top of `branch` on a fresh adapter of `backend`.
    pub async fn apply_patch_with(
        &self,
        backend: &str,
        branch: &BranchId,
        patch: &Patch,
    ) -> Result<Branch> {
        let source = self.branches.get(branch)?;
        let factory = self.controller.factory(backend).ok_or_else(|| {
            TimeMachineError::validation(format!("no adapter registered for backend '{backend}'"))
        })?;

        let mut adapter = factory.create();
        adapter.initialize().await?;
        let result = self.patches.apply(adapter.as_ref(), &source, patch).await;
        if let Err(err) = adapter.cleanup().await {
            warn!(backend, error = %err, "adapter cleanup failed");
        }

        let branch = result?;
        self.flush()?;
        Ok(branch)
    }

    /// Validates `patch` without applying it.
    pub fn validate_patch(&self, patch: &Patch) -> ValidationReport {
        self.patches.validate(patch)
    }

    /// Expands a registered macro into a patch.
    pub fn expand_macro(&self, name: &str, params: &Value) -> Result<Patch> {
        self.patches.expand_macro(name, params)
    }

    /// Registers a custom macro template.
    pub fn register_macro(&self, template: MacroTemplate) -> Result<()> {
        self.patches.register_macro(template)
    }

    /// Shorthand for a one-operation patch.
    pub async fn apply_operation(
        &self,
        branch: &BranchId,
        name: &str,
        operation: PatchOperation,
    ) -> Result<Branch> {
        self.apply_patch(branch, &Patch::new(name).with_operation(operation)).await
    }

    // --------------------------------------------------------------- diffs

    /// Default diff options of this engine.
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions::default()
            .with_max_depth(self.config.diff_max_depth)
            .with_network(self.config.network.clone())
    }

    /// Diff between two branches with the engine's default options.
    pub fn generate_diff(&self, from: &BranchId, to: &BranchId) -> Result<Arc<Diff>> {
        self.generate_diff_with(from, to, &self.diff_options())
    }

    /// Diff between two branches.
    pub fn generate_diff_with(
        &self,
        from: &BranchId,
        to: &BranchId,
        options: &DiffOptions,
    ) -> Result<Arc<Diff>> {
        self.branches.get(from)?;
        self.branches.get(to)?;
        self.diffs.generate(from, to, options)
    }

    /// Renders the diff between two branches.
    pub fn render_diff(&self, from: &BranchId, to: &BranchId, format: &str) -> Result<String> {
        let format: DiffFormat = format.parse()?;
        let diff = self.generate_diff(from, to)?;
        render_as(&diff, format)
    }

    // ---------------------------------------------------------- housekeeping

    /// Aggregate numbers of every component.
    pub fn get_engine_stats(&self) -> EngineStats {
        EngineStats {
            store: self.store.stats(),
            branches: self.branches.len(),
            tips: self.branches.tips().len(),
            jobs: self.controller.stats(),
            cached_diffs: self.diffs.cached(),
            macros: self.patches.macros().names().len(),
            sessions: self.sessions.len(),
            persistent: self.index_file.is_some(),
        }
    }

    /// Deletes snapshots no branch can reach that are older than `max_age`.
    ///
    /// Roots are the snapshots of every branch and of every unfinished job; marking
    /// follows parent links, so delta bases of kept snapshots are kept. Unmarked
    /// snapshots younger than `max_age` are kept as roots too. Running jobs cannot store
    /// new snapshots while the sweep decides and deletes.
    pub fn cleanup_old_snapshots(&self, max_age: Duration) -> Result<CleanupReport> {
        let cutoff = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let paused = self.controller.pause_capture();
        let snapshots = self.store.list();
        let links = self.store.parent_links();

        let mut roots: BTreeSet<SnapshotId> = self.branches.referenced_snapshots();
        roots.extend(self.controller.live_snapshots());
        let reachable = mark(&roots, &links);
        let recent: BTreeSet<SnapshotId> = snapshots
            .iter()
            .filter(|s| !reachable.contains(&s.id) && s.created_at > cutoff)
            .map(|s| s.id)
            .collect();
        let kept = mark(&recent, &links).union(&reachable).copied().collect::<BTreeSet<_>>();

        let mut doomed: Vec<&Snapshot> =
            snapshots.iter().filter(|s| !kept.contains(&s.id)).collect();
        // Deltas go before their bases.
        doomed.sort_by(|a, b| b.chain_depth.cmp(&a.chain_depth));

        let mut report = CleanupReport {
            scanned: snapshots.len(),
            reachable: reachable.len(),
            recent: recent.len(),
            deleted: Vec::new(),
        };
        for snapshot in doomed {
            if self.store.delete(&snapshot.id)? {
                report.deleted.push(snapshot.id);
            }
        }
        drop(paused);
        info!(
            scanned = report.scanned,
            deleted = report.deleted.len(),
            reachable = report.reachable,
            "snapshot sweep finished"
        );
        if !report.deleted.is_empty() {
            self.flush()?;
        }
        Ok(report)
    }

    // ------------------------------------------------------------- sessions

    /// Opens a forensic session.
    pub fn create_session(
        &self,
        name: impl Into<String>,
        target_contracts: Vec<String>,
        target_transactions: Vec<String>,
    ) -> Result<ForensicSession> {
        self.sessions.create_session(name, target_contracts, target_transactions)
    }

    /// Attaches an existing branch to a session.
    pub fn attach_branch(&self, session: &SessionId, branch: &BranchId) -> Result<ForensicSession> {
        self.branches.get(branch)?;
        self.sessions.attach_branch(session, branch.clone())
    }

    /// Bookmarks an existing branch in a session.
    pub fn add_bookmark(
        &self,
        session: &SessionId,
        branch: &BranchId,
        label: impl Into<String>,
        note: Option<String>,
    ) -> Result<ForensicSession> {
        self.branches.get(branch)?;
        self.sessions.add_bookmark(session, branch.clone(), label, note)
    }

    /// Records a finding, optionally pinned to an existing branch.
    pub fn add_finding(
        &self,
        session: &SessionId,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        branch: Option<&BranchId>,
    ) -> Result<ForensicSession> {
        if let Some(branch) = branch {
            self.branches.get(branch)?;
        }
        self.sessions.add_finding(session, severity, title, description, branch.cloned())
    }

    /// Looks a session up.
    pub fn get_session(&self, id: &SessionId) -> Result<ForensicSession> {
        self.sessions.get(id)
    }

    /// Sessions in creation order.
    pub fn list_sessions(&self) -> Vec<ForensicSession> {
        self.sessions.list()
    }
}

/// Closure of `roots` under the parent relation.
fn mark(
    roots: &BTreeSet<SnapshotId>,
    links: &BTreeMap<SnapshotId, Option<SnapshotId>>,
) -> BTreeSet<SnapshotId> {
    let mut marked = BTreeSet::new();
    let mut stack: Vec<SnapshotId> = roots.iter().copied().collect();
    while let Some(id) = stack.pop() {
        if !links.contains_key(&id) || !marked.insert(id) {
            continue;
        }
        if let Some(Some(parent)) = links.get(&id) {
            stack.push(*parent);
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use rewind_common::{
        logging::ensure_test_logging,
        test_utils::{sample_state, ALICE, BOB},
        ReplayTarget,
    };
    use tempfile::TempDir;

    fn machine() -> TimeMachine {
        ensure_test_logging(None);
        TimeMachine::new(EngineConfig::default()).unwrap()
    }

    async fn replayed(machine: &TimeMachine) -> Branch {
        let job = machine
            .create_replay_job(CreateJob::new("mock", ReplayTarget::BlockRange { start: 100, end: 102 }))
            .unwrap();
        let job = machine.run_replay_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
        machine.get_branch(job.branch_id.as_ref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_replay_patch_and_diff() {
        let machine = machine();
        let base = replayed(&machine).await;

        let patched = machine
            .apply_operation(&base.id, "fund bob", PatchOperation::balance(&BOB, U256::from(1u64)))
            .await
            .unwrap();
        assert_eq!(patched.parent_branch_id.as_ref(), Some(&base.id));
        assert_eq!(machine.branch_state(&patched.id).unwrap().balance(&BOB), U256::from(1u64));

        let diff = machine.generate_diff(&base.id, &patched.id).unwrap();
        let bob = rewind_common::format_address(&BOB);
        assert_eq!(diff.balance_changes[&bob].old_balance, "0x0");
        assert_eq!(diff.balance_changes[&bob].new_balance, "0x1");
        assert_eq!(diff.balance_changes[&bob].delta.as_deref(), Some("+1"));

        let compact = machine.render_diff(&base.id, &patched.id, "compact").unwrap();
        assert!(compact.contains("balance=1"));
        assert!(machine.render_diff(&base.id, &patched.id, "yaml").is_err());

        let stats = machine.get_engine_stats();
        assert_eq!(stats.branches, 2);
        assert_eq!(stats.jobs.completed, 1);
        assert_eq!(stats.cached_diffs, 1);
    }

    #[tokio::test]
    async fn test_ids_are_resolved_first() {
        let machine = machine();
        let missing = BranchId::new("br-missing");
        let branch = machine.import_state("genesis", &sample_state(1), 1).unwrap();

        assert!(machine.generate_diff(&branch.id, &missing).unwrap_err().is_not_found(EntityKind::Branch));
        let patch = Patch::new("p").with_operation(PatchOperation::nonce(&ALICE, 1));
        assert!(machine.apply_patch(&missing, &patch).await.unwrap_err().is_not_found(EntityKind::Branch));

        let ghost = CreateBranch::new("ghost", SnapshotId::of_bytes(b"nothing"), 1);
        assert!(machine.create_branch(ghost).unwrap_err().is_not_found(EntityKind::Snapshot));
        let orphan = CreateBranch::new("orphan", branch.snapshot_id, 1).with_parent(missing.clone());
        assert!(machine.create_branch(orphan).unwrap_err().is_not_found(EntityKind::Branch));

        let session = machine.create_session("case", Vec::new(), Vec::new()).unwrap();
        assert!(machine.attach_branch(&session.id, &missing).is_err());
        let session = machine.attach_branch(&session.id, &branch.id).unwrap();
        assert_eq!(session.branch_ids, vec![branch.id]);
        assert_eq!(machine.list_branches(&BranchFilter::default()).len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_reachable_snapshots() {
        let machine = machine();
        let kept = machine.import_state("kept", &sample_state(1), 1).unwrap();
        let child = machine.store().put_child(&kept.snapshot_id, &sample_state(2), 2).unwrap().id;
        let orphan = machine.store().put(&sample_state(3), 3).unwrap().id;

        let report = machine.cleanup_old_snapshots(Duration::from_secs(3600)).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.recent, 2);

        let report = machine.cleanup_old_snapshots(Duration::ZERO).unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert!(report.deleted.contains(&child));
        assert!(report.deleted.contains(&orphan));
        assert!(machine.store().contains(&kept.snapshot_id));
        assert_eq!(machine.branch_state(&kept.id).unwrap(), sample_state(1));
    }

    #[test]
    fn test_unknown_index_version_is_rejected() {
        ensure_test_logging(None);
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default().with_data_dir(dir.path());
        TimeMachine::new(config.clone()).unwrap().import_state("g", &sample_state(1), 1).unwrap();

        let path = dir.path().join("index.json");
        let mut index: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        index["version"] = Value::from(INDEX_VERSION + 98);
        fs::write(&path, serde_json::to_vec(&index).unwrap()).unwrap();

        match TimeMachine::new(config) {
            Err(TimeMachineError::Storage(StorageError::UnsupportedIndexVersion {
                found,
                expected,
            })) => {
                assert_eq!(found, INDEX_VERSION + 98);
                assert_eq!(expected, INDEX_VERSION);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("index with an unknown version was accepted"),
        }
    }

    #[tokio::test]
    async fn test_cleanup_spares_running_replay() {
        let machine = machine();
        let slow = MockChainConfig::default().with_latency(Duration::from_millis(200));
        machine.controller().register_adapter(
            "slow",
            Arc::new(move || Box::new(MockChainAdapter::new(slow.clone())) as Box<dyn VmAdapter>),
        );
        let job = machine
            .create_replay_job(CreateJob::new("slow", ReplayTarget::BlockRange { start: 100, end: 102 }))
            .unwrap();
        let handle = machine.spawn_replay_job(&job.id).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while machine.controller().live_snapshots().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(machine.get_job(&job.id).unwrap().status, JobStatus::Running);

        let report = machine.cleanup_old_snapshots(Duration::ZERO).unwrap();
        assert!(report.deleted.is_empty(), "{:?}", report.deleted);

        let job = handle.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
        assert_eq!(job.snapshot_ids.len(), 3);
        assert!(machine.branch_state(job.branch_id.as_ref().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_lineage_survives_restart() {
        ensure_test_logging(None);
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default().with_data_dir(dir.path());

        let (tip, state) = {
            let machine = TimeMachine::new(config.clone()).unwrap();
            let base = replayed(&machine).await;
            let patched = machine
                .apply_operation(&base.id, "bump", PatchOperation::nonce(&ALICE, 7))
                .await
                .unwrap();
            let state = machine.branch_state(&patched.id).unwrap();
            machine.shutdown().unwrap();
            (patched, state)
        };
        assert!(dir.path().join("index.json").exists());

        let machine = TimeMachine::new(config).unwrap();
        assert_eq!(machine.get_branch(&tip.id).unwrap(), tip);
        assert_eq!(machine.branch_state(&tip.id).unwrap(), state);
        assert_eq!(machine.branch_ancestry(&tip.id).unwrap().len(), 2);
        assert_eq!(machine.lineage_index().branches.len(), 2);
    }
}
