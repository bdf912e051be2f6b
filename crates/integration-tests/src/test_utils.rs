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

//! Test utilities for integration tests

/// Initialization utilities for tests
pub mod init {
    use std::path::PathBuf;

    /// Initializes logging and, when `use_temp_dir` is set, points
    /// `REWIND_DATA_DIR` at a per-process temp directory which is returned.
    pub fn init_test_environment(use_temp_dir: bool) -> Option<PathBuf> {
        rewind_common::logging::ensure_test_logging(None);
        use_temp_dir.then(rewind_common::test_utils::setup_test_environment)
    }
}

/// Engine testing utilities
pub mod engine {
    use eyre::{ensure, eyre, Result};
    use rewind_common::{Branch, CreateJob, JobStatus, ReplayTarget};
    use rewind_engine::{EngineConfig, TimeMachine};
    use tracing::info;

    /// An in-memory time machine with the default backends.
    pub fn in_memory() -> Result<TimeMachine> {
        Ok(TimeMachine::new(EngineConfig::default())?)
    }

    /// Replays `target` on `backend` and returns the resulting branch.
    pub async fn replay(
        machine: &TimeMachine,
        backend: &str,
        target: ReplayTarget,
    ) -> Result<Branch> {
        let job = machine.create_replay_job(CreateJob::new(backend, target))?;
        let job = machine.run_replay_job(&job.id).await?;
        ensure!(
            job.status == JobStatus::Completed,
            "job {} ended {}: {:?}",
            job.id,
            job.status,
            job.error_message
        );
        let branch_id = job.branch_id.ok_or_else(|| eyre!("completed job without branch"))?;
        info!(job = %job.id, branch = %branch_id, "replay finished");
        Ok(machine.get_branch(&branch_id)?)
    }

    /// Replays the default mock chain, blocks 100 to 102.
    pub async fn replay_mock_chain(machine: &TimeMachine) -> Result<Branch> {
        replay(machine, "mock", ReplayTarget::BlockRange { start: 100, end: 102 }).await
    }
}

/// Mock JSON-RPC node utilities
pub mod node {
    use serde_json::{json, Value};
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    /// Answers every `rpc_method` call with `result`.
    pub async fn respond(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": rpc_method})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result})),
            )
            .mount(server)
            .await;
    }

    /// A node at head `0x64` whose every block is empty and every account holds
    /// `balance` wei at nonce 1 without code.
    pub async fn start_anvil_like(balance: &str) -> MockServer {
        let server = MockServer::start().await;
        respond(&server, "eth_blockNumber", json!("0x64")).await;
        respond(&server, "evm_snapshot", json!("0x1")).await;
        respond(&server, "evm_revert", json!(true)).await;
        respond(
            &server,
            "eth_getBlockByNumber",
            json!({
                "number": "0x64",
                "hash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                "parentHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                "timestamp": "0x65",
                "gasUsed": "0x0",
                "gasLimit": "0x1c9c380",
                "transactions": []
            }),
        )
        .await;
        respond(&server, "eth_getLogs", json!([])).await;
        respond(&server, "eth_getBalance", json!(balance)).await;
        respond(&server, "eth_getTransactionCount", json!("0x1")).await;
        respond(&server, "eth_getCode", json!("0x")).await;
        server
    }
}
