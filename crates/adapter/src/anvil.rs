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

//! Local fork node (anvil) management.
//!
//! [`AnvilAdapter`] owns an `anvil` child process for its whole lifetime:
//! `initialize` spawns it and waits until `eth_blockNumber` answers, `cleanup` asks it
//! to terminate and kills it if it does not exit in time. The child is also spawned
//! with `kill_on_drop`, so a dropped adapter never leaks a node.

use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use alloy_primitives::B256;
use async_trait::async_trait;
use rewind_common::{
    env::REWIND_ANVIL_BIN, AdapterError, Block, CallTrace, ExecutionOutcome, GasEstimate,
    PatchOperation, SnapshotHandle, State, StateQuery, Transaction, TransactionRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{EventStream, NodeDialect, RpcClient, RpcNodeAdapter, VmAdapter};

/// Delay between readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration of a spawned anvil node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnvilConfig {
    /// Interface to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Chain id override
    pub chain_id: Option<u64>,
    /// Upstream RPC to fork from
    pub fork_url: Option<String>,
    /// Block to fork at; latest when unset
    pub fork_block_number: Option<u64>,
    /// Seconds between mined blocks; 0 disables automatic mining
    pub block_time: u64,
    /// Number of dev accounts
    pub accounts: u32,
    /// Balance of each dev account, in ether
    pub balance: u64,
    /// Block gas limit
    pub gas_limit: Option<u64>,
    /// Gas price in wei
    pub gas_price: Option<u64>,
    /// anvil binary; `REWIND_ANVIL_BIN` takes precedence
    pub binary: PathBuf,
    /// How long `initialize` waits for the node, in milliseconds
    pub ready_timeout_ms: u64,
    /// How long `cleanup` waits for a graceful exit, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for AnvilConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8545,
            chain_id: None,
            fork_url: None,
            fork_block_number: None,
            block_time: 0,
            accounts: 10,
            balance: 10_000,
            gas_limit: None,
            gas_price: None,
            binary: PathBuf::from("anvil"),
            ready_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl AnvilConfig {
    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Forks from `url`, optionally pinned at `block`.
    pub fn with_fork(mut self, url: impl Into<String>, block: Option<u64>) -> Self {
        self.fork_url = Some(url.into());
        self.fork_block_number = block;
        self
    }

    /// Sets the block time; 0 means manual mining.
    pub fn with_block_time(mut self, seconds: u64) -> Self {
        self.block_time = seconds;
        self
    }

    /// Sets the binary.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Sets the readiness timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Readiness timeout.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Graceful shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// HTTP endpoint of the node.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Binary to execute, honoring `REWIND_ANVIL_BIN`.
    pub fn resolved_binary(&self) -> PathBuf {
        std::env::var_os(REWIND_ANVIL_BIN).map(PathBuf::from).unwrap_or_else(|| self.binary.clone())
    }

    /// Command line arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--accounts".to_string(),
            self.accounts.to_string(),
            "--balance".to_string(),
            self.balance.to_string(),
        ];
        if let Some(chain_id) = self.chain_id {
            args.extend(["--chain-id".to_string(), chain_id.to_string()]);
        }
        if let Some(fork_url) = &self.fork_url {
            args.extend(["--fork-url".to_string(), fork_url.clone()]);
            if let Some(block) = self.fork_block_number {
                args.extend(["--fork-block-number".to_string(), block.to_string()]);
            }
        }
        if self.block_time > 0 {
            args.extend(["--block-time".to_string(), self.block_time.to_string()]);
        } else {
            args.push("--no-mining".to_string());
        }
        if let Some(gas_limit) = self.gas_limit {
            args.extend(["--gas-limit".to_string(), gas_limit.to_string()]);
        }
        if let Some(gas_price) = self.gas_price {
            args.extend(["--gas-price".to_string(), gas_price.to_string()]);
        }
        args
    }
}

/// A running anvil child process.
#[derive(Debug)]
pub struct AnvilProcess {
    child: Child,
    shutdown_timeout: Duration,
}

impl AnvilProcess {
    /// Spawns the node and waits until it answers RPC calls.
    pub async fn spawn(config: &AnvilConfig, client: &RpcClient) -> Result<Self, AdapterError> {
        let binary = config.resolved_binary();
        let child = Command::new(&binary)
            .args(config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AdapterError::Process(format!("failed to spawn {}: {e}", binary.display()))
            })?;
        info!(binary = %binary.display(), pid = ?child.id(), endpoint = %config.endpoint(), "spawned anvil");

        let mut process = Self { child, shutdown_timeout: config.shutdown_timeout() };
        if let Err(e) = process.wait_until_ready(client, config.ready_timeout()).await {
            process.kill().await;
            return Err(e);
        }
        Ok(process)
    }

    async fn wait_until_ready(
        &mut self,
        client: &RpcClient,
        timeout: Duration,
    ) -> Result<(), AdapterError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let exited =
                self.child.try_wait().map_err(|e| AdapterError::Process(e.to_string()))?;
            if let Some(status) = exited {
                return Err(AdapterError::Process(format!("anvil exited during startup: {status}")));
            }

            match client.request_value("eth_blockNumber", json!([])).await {
                Ok(_) => {
                    info!(attempt, elapsed = ?started.elapsed(), "anvil is ready");
                    return Ok(());
                }
                Err(e) => debug!(attempt, "anvil not ready: {e}"),
            }

            if started.elapsed() >= timeout {
                return Err(AdapterError::Timeout {
                    operation: "anvil readiness".to_string(),
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// OS process id, while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Requests a graceful exit, then kills the child after the shutdown timeout.
    pub async fn shutdown(mut self) -> Result<(), AdapterError> {
        if let Some(pid) = self.child.id() {
            #[cfg(unix)]
            {
                let terminated = Command::new("kill")
                    .args(["-TERM", &pid.to_string()])
                    .status()
                    .await
                    .map(|status| status.success())
                    .unwrap_or(false);
                if !terminated {
                    warn!(pid, "SIGTERM could not be delivered");
                }
            }

            match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(pid, %status, "anvil exited");
                    return Ok(());
                }
                Ok(Err(e)) => warn!(pid, "waiting for anvil failed: {e}"),
                Err(_) => warn!(pid, timeout = ?self.shutdown_timeout, "anvil ignored SIGTERM, killing"),
            }
        }
        self.kill().await;
        Ok(())
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("kill on anvil child failed: {e}");
        }
    }
}

/// Reference [`VmAdapter`]: a private anvil node per adapter instance.
#[derive(Debug)]
pub struct AnvilAdapter {
    config: AnvilConfig,
    node: RpcNodeAdapter,
    process: Option<AnvilProcess>,
}

impl AnvilAdapter {
    /// Adapter that will spawn a node from `config` on `initialize`.
    pub fn new(config: AnvilConfig) -> Self {
        let node = RpcNodeAdapter::connect(config.endpoint(), NodeDialect::Anvil);
        Self { config, node, process: None }
    }

    /// Node configuration.
    pub fn config(&self) -> &AnvilConfig {
        &self.config
    }
}

#[async_trait]
impl VmAdapter for AnvilAdapter {
    fn backend(&self) -> &str {
        "anvil"
    }

    fn is_ready(&self) -> bool {
        self.process.is_some() && self.node.is_ready()
    }

    async fn initialize(&mut self) -> Result<(), AdapterError> {
        if self.process.is_some() {
            return Ok(());
        }
        let process = AnvilProcess::spawn(&self.config, self.node.client()).await?;
        self.process = Some(process);
        self.node.mark_ready(true);
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), AdapterError> {
        self.node.mark_ready(false);
        match self.process.take() {
            Some(process) => process.shutdown().await,
            None => Ok(()),
        }
    }

    async fn block_number(&self) -> Result<u64, AdapterError> {
        self.node.block_number().await
    }

    async fn load_block_range(&self, start: u64, end: u64) -> Result<Vec<Block>, AdapterError> {
        self.node.load_block_range(start, end).await
    }

    async fn load_transaction(&self, hash: B256) -> Result<Option<Transaction>, AdapterError> {
        self.node.load_transaction(hash).await
    }

    async fn get_state_at_block(
        &self,
        number: u64,
        query: &StateQuery,
    ) -> Result<State, AdapterError> {
        self.node.get_state_at_block(number, query).await
    }

    async fn capture_state(&self, query: &StateQuery) -> Result<State, AdapterError> {
        self.node.capture_state(query).await
    }

    async fn load_state(&self, state: &State) -> Result<(), AdapterError> {
        self.node.load_state(state).await
    }

    async fn apply_state_patch(&self, operation: &PatchOperation) -> Result<bool, AdapterError> {
        self.node.apply_state_patch(operation).await
    }

    async fn create_snapshot(&self) -> Result<SnapshotHandle, AdapterError> {
        self.node.create_snapshot().await
    }

    async fn restore_snapshot(&self, handle: &SnapshotHandle) -> Result<bool, AdapterError> {
        self.node.restore_snapshot(handle).await
    }

    async fn execute_transaction(
        &self,
        tx: &TransactionRequest,
    ) -> Result<ExecutionOutcome, AdapterError> {
        self.node.execute_transaction(tx).await
    }

    async fn trace_transaction(&self, hash: B256) -> Result<CallTrace, AdapterError> {
        self.node.trace_transaction(hash).await
    }

    fn stream_events(&self, start: u64, end: Option<u64>) -> EventStream {
        self.node.stream_events(start, end)
    }

    async fn get_gas_estimates(
        &self,
        txs: &[TransactionRequest],
    ) -> Result<Vec<GasEstimate>, AdapterError> {
        self.node.get_gas_estimates(txs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::logging::ensure_test_logging;

    #[test]
    fn test_manual_mining_by_default() {
        let args = AnvilConfig::default().args();
        assert!(args.contains(&"--no-mining".to_string()));
        assert!(!args.contains(&"--fork-url".to_string()));
    }

    #[test]
    fn test_fork_args() {
        let config = AnvilConfig::default()
            .with_port(9545)
            .with_fork("http://upstream:8545", Some(18_000_000))
            .with_block_time(2);
        let args = config.args();
        let joined = args.join(" ");
        assert!(joined.contains("--port 9545"));
        assert!(joined.contains("--fork-url http://upstream:8545"));
        assert!(joined.contains("--fork-block-number 18000000"));
        assert!(joined.contains("--block-time 2"));
        assert!(!joined.contains("--no-mining"));
        assert_eq!(config.endpoint(), "http://127.0.0.1:9545");
    }

    #[test]
    fn test_config_from_partial_toml_like_json() {
        let config: AnvilConfig = serde_json::from_value(json!({"port": 9000})).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.ready_timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_binary_is_process_error() {
        ensure_test_logging(None);
        let config = AnvilConfig::default()
            .with_binary("/nonexistent/rewind-anvil")
            .with_ready_timeout(Duration::from_millis(200));
        let mut adapter = AnvilAdapter::new(config);
        if std::env::var_os(REWIND_ANVIL_BIN).is_some() {
            return;
        }
        let err = adapter.initialize().await.unwrap_err();
        assert!(matches!(err, AdapterError::Process(_)));
        assert!(!adapter.is_ready());
        adapter.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_that_never_answers_times_out() {
        ensure_test_logging(None);
        if std::env::var_os(REWIND_ANVIL_BIN).is_some() || !std::path::Path::new("/bin/sh").exists() {
            return;
        }
        // Accepts any flags and never serves RPC.
        let script = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let config = AnvilConfig::default()
            .with_port(1)
            .with_binary(script.to_path_buf())
            .with_ready_timeout(Duration::from_millis(300));
        let client = RpcClient::new(config.endpoint()).with_timeout(Duration::from_millis(100));

        let err = AnvilProcess::spawn(&config, &client).await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }
}
