//! Lineage persistence across engine restarts.

use alloy_primitives::U256;
use rewind_common::{test_utils::BOB, DataPath, PatchOperation};
use rewind_engine::{EngineConfig, TimeMachine};
use rewind_integration_tests::test_utils::{engine, init};

#[tokio::test]
async fn test_branches_survive_restart() {
    let dir = init::init_test_environment(true).unwrap();
    let config = EngineConfig::default().with_env_overrides();
    assert_eq!(config.data_path().data_dir(), Some(dir.clone()));

    let (base, patched) = {
        let machine = TimeMachine::new(config.clone()).unwrap();
        let base = engine::replay_mock_chain(&machine).await.unwrap();
        let patched = machine
            .apply_operation(&base.id, "fund", PatchOperation::balance(&BOB, U256::from(3u64)))
            .await
            .unwrap();
        machine.shutdown().unwrap();
        (base, patched)
    };
    assert!(dir.join("index.json").exists());
    assert!(dir.join("snapshots").is_dir());

    let machine = TimeMachine::new(config).unwrap();
    assert!(machine.get_engine_stats().persistent);
    assert_eq!(machine.get_branch(&patched.id).unwrap(), patched);
    assert_eq!(machine.branch_state(&patched.id).unwrap().balance(&BOB), U256::from(3u64));

    let diff = machine.generate_diff(&base.id, &patched.id).unwrap();
    assert_eq!(diff.statistics.balance_changes, 1);
}
