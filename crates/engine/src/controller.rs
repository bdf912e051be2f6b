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

//! Replay job orchestration.
//!
//! Every job runs on its own adapter instance, created from the factory registered for
//! the job's backend tag. A run initializes the adapter, replays the target into
//! snapshots, applies the job's patches and finally records a branch. The adapter is
//! always cleaned up, whatever the outcome.
//!
//! The whole unit of work is bounded by the replay timeout and raced against the job's
//! cancellation channel, so a cancelled or stuck job stops at the next adapter await.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use alloy_primitives::B256;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockWriteGuard};
use rewind_adapter::{touched_accounts, AdapterFactory, VmAdapter};
use rewind_common::{
    AdapterError, CreateBranch, CreateJob, EntityKind, JobId, JobStatus, PatchId, ReplayJob,
    ReplayTarget, Result, SnapshotId, StateQuery, TimeMachineError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{apply_operations, BranchManager, PatchEngine, PutOutcome, SnapshotStore};

/// Counts of jobs per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// All jobs
    pub total: usize,
    /// Waiting for dispatch
    pub pending: usize,
    /// In flight
    pub running: usize,
    /// Finished with a branch
    pub completed: usize,
    /// Stopped by an error
    pub failed: usize,
    /// Stopped on request
    pub cancelled: usize,
    /// Registered backend tags
    pub backends: Vec<String>,
}

/// Everything a successful replay produced, before the branch exists.
#[derive(Debug)]
struct Replayed {
    snapshots: Vec<SnapshotId>,
    tip: SnapshotId,
    block_number: u64,
    tx_index: Option<u64>,
    patches: Vec<PatchId>,
    metadata: BTreeMap<String, Value>,
}

/// Runs replay jobs against registered adapters.
pub struct ReplayJobController {
    registry: RwLock<HashMap<String, Arc<dyn AdapterFactory>>>,
    jobs: DashMap<JobId, ReplayJob>,
    order: RwLock<Vec<JobId>>,
    cancels: DashMap<JobId, watch::Sender<bool>>,
    /// Held shared while a job stores and records a snapshot, exclusively by sweeps
    capture: RwLock<()>,
    store: Arc<SnapshotStore>,
    branches: Arc<BranchManager>,
    patches: Arc<PatchEngine>,
    replay_timeout: Duration,
}

impl fmt::Debug for ReplayJobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayJobController")
            .field("backends", &self.backends())
            .field("jobs", &self.jobs.len())
            .field("replay_timeout", &self.replay_timeout)
            .finish_non_exhaustive()
    }
}

impl ReplayJobController {
    /// Controller persisting into `store` and `branches`.
    pub fn new(
        store: Arc<SnapshotStore>,
        branches: Arc<BranchManager>,
        patches: Arc<PatchEngine>,
        replay_timeout: Duration,
    ) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            jobs: DashMap::new(),
            order: RwLock::new(Vec::new()),
            cancels: DashMap::new(),
            capture: RwLock::new(()),
            store,
            branches,
            patches,
            replay_timeout,
        }
    }

    /// Registers `factory` under `tag`, replacing any previous registration.
    pub fn register_adapter(&self, tag: impl Into<String>, factory: Arc<dyn AdapterFactory>) {
        let tag = tag.into();
        info!(backend = %tag, "registered adapter");
        self.registry.write().insert(tag, factory);
    }

    /// Registered backend tags, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.registry.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Factory registered under `tag`.
    pub fn factory(&self, tag: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.registry.read().get(tag).cloned()
    }

    /// Records a new PENDING job.
    ///
    /// The backend tag is not resolved here; an unregistered backend fails the job when
    /// it runs.
    pub fn create_job(&self, request: CreateJob) -> Result<ReplayJob> {
        if request.vm_backend.trim().is_empty() {
            return Err(TimeMachineError::validation("job needs a vm_backend"));
        }
        if let ReplayTarget::BlockRange { start, end } = &request.target {
            if start > end {
                return Err(TimeMachineError::validation(format!(
                    "block range {start}..={end} is empty"
                )));
            }
        }
        if let Some(parent) = &request.parent_branch_id {
            if !self.branches.contains(parent) {
                return Err(TimeMachineError::not_found(EntityKind::Branch, parent));
            }
        }
        for patch in &request.patches {
            let report = self.patches.validate(patch);
            if !report.valid {
                return Err(TimeMachineError::validation(format!(
                    "patch '{}' is invalid: {}",
                    patch.name,
                    report.errors.join("; ")
                )));
            }
        }

        let job = ReplayJob::pending(request);
        let (sender, _) = watch::channel(false);
        self.cancels.insert(job.id.clone(), sender);
        self.order.write().push(job.id.clone());
        self.jobs.insert(job.id.clone(), job.clone());
        info!(job = %job.id, backend = %job.vm_backend, target = %job.target, "created replay job");
        Ok(job)
    }

    /// Looks a job up.
    pub fn get_job(&self, id: &JobId) -> Result<ReplayJob> {
        self.jobs
            .get(id)
            .map(|job| job.clone())
            .ok_or_else(|| TimeMachineError::not_found(EntityKind::Job, id))
    }

    /// Jobs in creation order, optionally only those with `status`.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<ReplayJob> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.jobs.get(id).map(|job| job.clone()))
            .filter(|job| status.is_none_or(|s| job.status == s))
            .collect()
    }

    /// Counts per status.
    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats { backends: self.backends(), ..Default::default() };
        for job in self.jobs.iter() {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Snapshots produced by jobs that have not reached a terminal state.
    ///
    /// A running job records each snapshot as soon as it is stored.
    pub fn live_snapshots(&self) -> Vec<SnapshotId> {
        self.jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .flat_map(|job| job.snapshot_ids.clone())
            .collect()
    }

    /// Blocks snapshot capture by running jobs until the guard is dropped.
    ///
    /// Sweeps hold it while they decide what to delete, so every stored snapshot of a
    /// running job is visible in [`live_snapshots`](Self::live_snapshots).
    pub fn pause_capture(&self) -> RwLockWriteGuard<'_, ()> {
        self.capture.write()
    }

    /// Requests cancellation. Terminal jobs are returned unchanged.
    pub fn cancel(&self, id: &JobId) -> Result<ReplayJob> {
        let (job, started) = {
            let mut job = self
                .jobs
                .get_mut(id)
                .ok_or_else(|| TimeMachineError::not_found(EntityKind::Job, id))?;
            if job.status.is_terminal() {
                return Ok(job.clone());
            }
            let started = job.status == JobStatus::Running;
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            (job.clone(), started)
        };
        if started {
            if let Some(sender) = self.cancels.get(id) {
                sender.send_replace(true);
            }
        } else {
            // Never dispatched, so no run will clean this up.
            self.cancels.remove(id);
        }
        info!(job = %id, "cancelled replay job");
        Ok(job)
    }

    /// Runs `run` on the tokio runtime.
    pub fn spawn(self: &Arc<Self>, id: JobId) -> JoinHandle<Result<ReplayJob>> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.run(&id).await })
    }

    /// Drives a PENDING job to a terminal state and returns the final record.
    ///
    /// Terminal jobs are returned as they are; a job already running is a conflict.
    pub async fn run(&self, id: &JobId) -> Result<ReplayJob> {
        let (job, factory) = {
            let mut job = self
                .jobs
                .get_mut(id)
                .ok_or_else(|| TimeMachineError::not_found(EntityKind::Job, id))?;
            match job.status {
                JobStatus::Pending => {}
                JobStatus::Running => {
                    return Err(TimeMachineError::Conflict(format!("job {id} is already running")))
                }
                _ => return Ok(job.clone()),
            }
            let Some(factory) = self.factory(&job.vm_backend) else {
                let message = format!("no adapter registered for backend '{}'", job.vm_backend);
                error!(job = %id, "{message}");
                job.status = JobStatus::Failed;
                job.error_message = Some(message);
                job.completed_at = Some(Utc::now());
                drop(job);
                self.cancels.remove(id);
                return self.get_job(id);
            };
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            (job.clone(), factory)
        };
        info!(job = %id, backend = %job.vm_backend, target = %job.target, "running replay job");

        let mut cancelled = match self.cancels.get(id) {
            Some(sender) => sender.subscribe(),
            None => watch::channel(false).1,
        };

        let mut adapter = factory.create();
        let outcome = {
            let work = async {
                match adapter.initialize().await {
                    Ok(()) => self.replay(adapter.as_ref(), &job).await,
                    Err(err) => Err(err.into()),
                }
            };
            tokio::select! {
                result = tokio::time::timeout(self.replay_timeout, work) => match result {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Timeout {
                        operation: format!("replay of {}", job.target),
                        elapsed: self.replay_timeout,
                    }
                    .into()),
                },
                _ = wait_cancelled(&mut cancelled) => Err(AdapterError::Cancelled.into()),
            }
        };
        if let Err(err) = adapter.cleanup().await {
            warn!(job = %id, error = %err, "adapter cleanup failed");
        }

        self.finish(id, &job, outcome)
    }

    fn finish(&self, id: &JobId, job: &ReplayJob, outcome: Result<Replayed>) -> Result<ReplayJob> {
        let mut record =
            self.jobs.get_mut(id).ok_or_else(|| TimeMachineError::not_found(EntityKind::Job, id))?;
        if record.status != JobStatus::Running {
            debug!(job = %id, status = %record.status, "job left RUNNING during replay");
            let record = record.clone();
            self.cancels.remove(id);
            return Ok(record);
        }

        let result = outcome.and_then(|replayed| {
            let branch = self.branches.create(self.branch_request(job, &replayed))?;
            Ok((replayed, branch))
        });
        match result {
            Ok((replayed, branch)) => {
                info!(
                    job = %id,
                    branch = %branch.id,
                    snapshots = replayed.snapshots.len(),
                    "replay job completed"
                );
                record.status = JobStatus::Completed;
                record.snapshot_ids = replayed.snapshots;
                record.branch_id = Some(branch.id);
            }
            Err(err) => {
                error!(job = %id, error = %err, "replay job failed");
                record.status = JobStatus::Failed;
                record.error_message = Some(err.to_string());
            }
        }
        record.completed_at = Some(Utc::now());
        let record = record.clone();
        self.cancels.remove(id);
        Ok(record)
    }

    /// Stores a snapshot through `put` and records it on the job.
    fn capture(
        &self,
        job: &JobId,
        put: impl FnOnce(&SnapshotStore) -> Result<PutOutcome>,
    ) -> Result<SnapshotId> {
        let _capture = self.capture.read();
        let id = put(&self.store)?.id;
        if let Some(mut record) = self.jobs.get_mut(job) {
            record.snapshot_ids.push(id);
        }
        Ok(id)
    }

    fn branch_request(&self, job: &ReplayJob, replayed: &Replayed) -> CreateBranch {
        let name = job.name.clone().unwrap_or_else(|| format!("replay {}", job.target));
        let mut request = CreateBranch::new(name, replayed.tip, replayed.block_number)
            .with_patches(replayed.patches.clone())
            .with_tag("replay")
            .with_tag(job.vm_backend.clone())
            .with_metadata("job_id", json!(job.id))
            .with_metadata("vm_backend", json!(job.vm_backend))
            .with_metadata("target", json!(job.target.to_string()));
        request.metadata.extend(replayed.metadata.clone());
        request.tx_index = replayed.tx_index;
        if let Some(parent) = &job.parent_branch_id {
            request = request.with_parent(parent.clone());
        }
        request
    }

    async fn replay(&self, adapter: &dyn VmAdapter, job: &ReplayJob) -> Result<Replayed> {
        let mut replayed = match &job.target {
            ReplayTarget::Block { number } => {
                self.replay_blocks(adapter, job, *number, *number).await?
            }
            ReplayTarget::BlockRange { start, end } => {
                self.replay_blocks(adapter, job, *start, *end).await?
            }
            ReplayTarget::Transaction { hash } => {
                self.replay_transaction(adapter, job, *hash).await?
            }
        };

        for patch in &job.patches {
            let expanded = self.patches.prepare(patch)?;
            let base = self.store.get(&replayed.tip)?;
            let outcome = apply_operations(adapter, &base, &expanded.operations).await?;
            let tip = replayed.tip;
            let id = self.capture(&job.id, |store| {
                store.put_child(&tip, &outcome.state, replayed.block_number)
            })?;
            debug!(job = %job.id, patch = %patch.name, snapshot = %id.short(), "applied job patch");
            replayed.tip = id;
            replayed.snapshots.push(id);
            replayed.patches.push(patch.id.clone());
            if !outcome.skipped.is_empty() {
                replayed
                    .metadata
                    .insert(format!("skipped_operations.{}", patch.id), json!(outcome.skipped));
            }
        }
        Ok(replayed)
    }

    /// Base snapshot the first replayed state is stored against.
    fn lineage_base(&self, job: &ReplayJob) -> Result<Option<SnapshotId>> {
        job.parent_branch_id
            .as_ref()
            .map(|parent| self.branches.get(parent).map(|b| b.snapshot_id))
            .transpose()
    }

    async fn replay_blocks(
        &self,
        adapter: &dyn VmAdapter,
        job: &ReplayJob,
        start: u64,
        end: u64,
    ) -> Result<Replayed> {
        let blocks = adapter.load_block_range(start, end).await?;
        if blocks.is_empty() {
            return Err(AdapterError::MissingData(format!("no blocks in {start}..={end}")).into());
        }
        let mut query = job.watch.clone();
        query.merge(&StateQuery::for_accounts(touched_accounts(&blocks)));

        let mut previous = self.lineage_base(job)?;
        let mut snapshots = Vec::with_capacity(blocks.len());
        let mut transactions = 0;
        for block in &blocks {
            let state = adapter.get_state_at_block(block.number, &query).await?;
            let id = self.capture(&job.id, |store| match &previous {
                Some(parent) => store.put_child(parent, &state, block.number),
                None => store.put(&state, block.number),
            })?;
            debug!(job = %job.id, block = block.number, snapshot = %id.short(), "captured block state");
            transactions += block.transactions.len();
            snapshots.push(id);
            previous = Some(id);
        }

        let (Some(&tip), Some(last)) = (snapshots.last(), blocks.last()) else {
            return Err(AdapterError::MissingData(format!("no blocks in {start}..={end}")).into());
        };
        let last = last.number;
        let mut metadata = BTreeMap::new();
        metadata.insert("blocks".to_string(), json!(blocks.len()));
        metadata.insert("transactions".to_string(), json!(transactions));
        Ok(Replayed {
            tip,
            snapshots,
            block_number: last,
            tx_index: None,
            patches: Vec::new(),
            metadata,
        })
    }

    async fn replay_transaction(
        &self,
        adapter: &dyn VmAdapter,
        job: &ReplayJob,
        hash: B256,
    ) -> Result<Replayed> {
        let tx = adapter
            .load_transaction(hash)
            .await?
            .ok_or_else(|| AdapterError::MissingData(format!("transaction {hash}")))?;
        let number = tx
            .block_number
            .ok_or_else(|| AdapterError::MissingData(format!("transaction {hash} is not mined")))?;

        let mut query = job.watch.clone();
        query.add_account(tx.from);
        if let Some(to) = tx.to {
            query.add_account(to);
        }

        let pre = adapter.get_state_at_block(number.saturating_sub(1), &query).await?;
        let post = adapter.get_state_at_block(number, &query).await?;
        let base = self.lineage_base(job)?;
        let pre_id = self.capture(&job.id, |store| match &base {
            Some(parent) => store.put_child(parent, &pre, number.saturating_sub(1)),
            None => store.put(&pre, number.saturating_sub(1)),
        })?;
        let post_id = self.capture(&job.id, |store| store.put_child(&pre_id, &post, number))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("transaction".to_string(), json!(hash));
        metadata.insert("pre_state".to_string(), json!(pre_id));
        match adapter.trace_transaction(hash).await {
            Ok(trace) => {
                metadata.insert("call_frames".to_string(), json!(trace.frame_count()));
                if let Some(reason) = &trace.error {
                    metadata.insert("revert_reason".to_string(), json!(reason));
                }
            }
            Err(err) => {
                warn!(job = %job.id, tx = %hash, error = %err, "trace unavailable");
                metadata.insert("trace_error".to_string(), json!(err.to_string()));
            }
        }

        Ok(Replayed {
            snapshots: vec![pre_id, post_id],
            tip: post_id,
            block_number: number,
            tx_index: tx.transaction_index,
            patches: Vec::new(),
            metadata,
        })
    }
}

/// Resolves once cancellation is requested; never when the sender is gone.
async fn wait_cancelled(receiver: &mut watch::Receiver<bool>) {
    if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_adapter::{MockChainAdapter, MockChainConfig};
    use rewind_common::{logging::ensure_test_logging, Patch, PatchOperation};

    fn controller(timeout: Duration) -> Arc<ReplayJobController> {
        ensure_test_logging(None);
        let store = Arc::new(SnapshotStore::in_memory());
        let branches = Arc::new(BranchManager::new(store.clone()));
        let patches = Arc::new(PatchEngine::new(store.clone(), branches.clone()));
        Arc::new(ReplayJobController::new(store, branches, patches, timeout))
    }

    fn register_mock(controller: &ReplayJobController, config: MockChainConfig) {
        controller.register_adapter(
            "mock",
            Arc::new(move || Box::new(MockChainAdapter::new(config.clone())) as Box<dyn VmAdapter>),
        );
    }

    #[tokio::test]
    async fn test_block_range_replay() {
        let controller = controller(Duration::from_secs(10));
        register_mock(&controller, MockChainConfig::default());
        let job = controller
            .create_job(CreateJob::new("mock", ReplayTarget::BlockRange { start: 100, end: 102 }))
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let job = controller.run(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
        assert_eq!(job.snapshot_ids.len(), 3);
        let branch = controller.branches.get(job.branch_id.as_ref().unwrap()).unwrap();
        assert_eq!(branch.block_number, 102);
        assert_eq!(branch.snapshot_id, job.snapshot_ids[2]);
        assert!(branch.tags.contains(&"replay".to_string()));
    }

    #[tokio::test]
    async fn test_unregistered_backend_fails() {
        let controller = controller(Duration::from_secs(10));
        let job = controller
            .create_job(CreateJob::new("nonexistent", ReplayTarget::Block { number: 1 }))
            .unwrap();
        let job = controller.run(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("nonexistent"));
        assert!(job.branch_id.is_none());

        // Terminal jobs are not retried.
        assert_eq!(controller.run(&job.id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_adapter_error_fails_without_branch() {
        let controller = controller(Duration::from_secs(10));
        let config = MockChainConfig::default();
        let lifecycle = config.lifecycle.clone();
        register_mock(&controller, config.fail_on_block(101));
        let job = controller
            .create_job(CreateJob::new("mock", ReplayTarget::BlockRange { start: 100, end: 102 }))
            .unwrap();
        let job = controller.run(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.branch_id.is_none());
        assert!(controller.branches.is_empty());
        assert_eq!(lifecycle.cleaned_up(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let controller = controller(Duration::from_millis(50));
        register_mock(&controller, MockChainConfig::default().with_latency(Duration::from_secs(5)));
        let job =
            controller.create_job(CreateJob::new("mock", ReplayTarget::Block { number: 100 })).unwrap();
        let job = controller.run(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let controller = controller(Duration::from_secs(30));
        let config = MockChainConfig::default().with_latency(Duration::from_secs(5));
        let lifecycle = config.lifecycle.clone();
        register_mock(&controller, config);
        let job = controller
            .create_job(CreateJob::new("mock", ReplayTarget::Block { number: 100 }))
            .unwrap();

        let handle = controller.spawn(job.id.clone());
        while controller.get_job(&job.id).unwrap().status != JobStatus::Running {
            tokio::task::yield_now().await;
        }
        controller.cancel(&job.id).unwrap();
        let job = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.branch_id.is_none());
        assert_eq!(lifecycle.cleaned_up(), 1);
        assert_eq!(controller.cancel(&job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let controller = controller(Duration::from_secs(10));
        let config = MockChainConfig::default();
        let lifecycle = config.lifecycle.clone();
        register_mock(&controller, config);
        let job =
            controller.create_job(CreateJob::new("mock", ReplayTarget::Block { number: 100 })).unwrap();
        assert_eq!(controller.cancels.len(), 1);

        assert_eq!(controller.cancel(&job.id).unwrap().status, JobStatus::Cancelled);
        assert!(controller.cancels.is_empty());

        let job = controller.run(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(lifecycle.initialized(), 0);
        assert!(controller.cancels.is_empty());
    }

    #[tokio::test]
    async fn test_running_job_exposes_its_snapshots() {
        let controller = controller(Duration::from_secs(30));
        register_mock(&controller, MockChainConfig::default().with_latency(Duration::from_millis(100)));
        let job = controller
            .create_job(CreateJob::new("mock", ReplayTarget::BlockRange { start: 100, end: 102 }))
            .unwrap();
        let handle = controller.spawn(job.id.clone());

        let live = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let live = controller.live_snapshots();
                if !live.is_empty() {
                    return live;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(controller.store.contains(&live[0]));

        let job = handle.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
        assert_eq!(job.snapshot_ids[0], live[0]);
        assert!(controller.live_snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_replay_with_patch() {
        let controller = controller(Duration::from_secs(10));
        let config = MockChainConfig::default();
        let hash = MockChainAdapter::new(config.clone()).transaction_hash(101).unwrap();
        let sender = config.accounts[1];
        register_mock(&controller, config);

        let patch = Patch::new("bump").with_operation(PatchOperation::nonce(&sender, 42));
        let job = controller
            .create_job(CreateJob::new("mock", ReplayTarget::Transaction { hash }).with_patch(patch))
            .unwrap();
        let job = controller.run(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
        assert_eq!(job.snapshot_ids.len(), 3);

        let branch = controller.branches.get(job.branch_id.as_ref().unwrap()).unwrap();
        assert_eq!(branch.block_number, 101);
        assert_eq!(branch.tx_index, Some(0));
        assert_eq!(branch.metadata["call_frames"], json!(1));
        assert_eq!(controller.store.get(&branch.snapshot_id).unwrap().nonce(&sender), 42);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let controller = controller(Duration::from_secs(10));
        let empty_range = CreateJob::new("mock", ReplayTarget::BlockRange { start: 5, end: 4 });
        assert!(matches!(controller.create_job(empty_range), Err(TimeMachineError::Validation(_))));

        let orphan = CreateJob::new("mock", ReplayTarget::Block { number: 1 })
            .with_parent("br-missing".into());
        assert!(controller.create_job(orphan).unwrap_err().is_not_found(EntityKind::Branch));
        assert_eq!(controller.stats().total, 0);
    }

    #[tokio::test]
    async fn test_stats_and_listing() {
        let controller = controller(Duration::from_secs(10));
        register_mock(&controller, MockChainConfig::default());
        let ok = controller.create_job(CreateJob::new("mock", ReplayTarget::Block { number: 100 })).unwrap();
        let bad = controller.create_job(CreateJob::new("evm", ReplayTarget::Block { number: 100 })).unwrap();
        controller.create_job(CreateJob::new("mock", ReplayTarget::Block { number: 101 })).unwrap();
        controller.run(&ok.id).await.unwrap();
        controller.run(&bad.id).await.unwrap();

        let stats = controller.stats();
        assert_eq!((stats.total, stats.completed, stats.failed, stats.pending), (3, 1, 1, 1));
        assert_eq!(stats.backends, vec!["mock".to_string()]);
        assert_eq!(controller.list_jobs(Some(JobStatus::Pending)).len(), 1);
        assert_eq!(controller.list_jobs(None)[0].id, ok.id);
    }
}
