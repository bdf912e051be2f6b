//! Patch application and diffs between branches.

use alloy_primitives::{Address, U256};
use rewind_adapter::{MockChainAdapter, MockChainConfig, VmAdapter};
use rewind_common::{
    format_address, test_utils::sample_state, ChangeType, Patch, PatchOperation,
    TimeMachineError,
};
use rewind_engine::{generate, DiffOptions};
use rewind_integration_tests::test_utils::{engine, init};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_diff_of_state_with_itself_is_empty() {
    init::init_test_environment(false);
    let state = sample_state(5);
    let diff = generate(&state, &state, &DiffOptions::default());
    assert!(diff.is_empty());
    assert_eq!(diff.statistics.total_changes, 0);
}

#[tokio::test]
async fn test_diff_is_symmetric_between_branches() {
    init::init_test_environment(false);
    let machine = engine::in_memory().unwrap();
    let from = engine::replay_mock_chain(&machine).await.unwrap();
    let to = machine
        .apply_patch(
            &from.id,
            &Patch::new("drain")
                .with_operation(PatchOperation::macro_call(
                    "drain_account",
                    json!({"address": format_address(&Address::repeat_byte(0x11))}),
                ))
                .with_operation(PatchOperation::storage(
                    &Address::repeat_byte(0x33),
                    U256::from(9u64),
                    U256::from(1u64),
                )),
        )
        .await
        .unwrap();

    let forward = machine.generate_diff(&from.id, &to.id).unwrap();
    let backward = machine.generate_diff(&to.id, &from.id).unwrap();
    assert!(!forward.is_empty());
    assert_eq!(forward.statistics.added, backward.statistics.removed);
    assert_eq!(forward.statistics.modified, backward.statistics.modified);
    for (f, b) in forward.changes.iter().zip(&backward.changes) {
        assert_eq!(f.path, b.path);
        assert_eq!(f.change_type, b.change_type.inverse());
    }
}

#[tokio::test]
async fn test_balance_patch_shows_up_in_diff() {
    init::init_test_environment(false);
    let machine = engine::in_memory().unwrap();
    let base = engine::replay_mock_chain(&machine).await.unwrap();
    let fresh = Address::repeat_byte(0x77);

    let patched = machine
        .apply_operation(&base.id, "fund", PatchOperation::balance(&fresh, U256::from(1u64)))
        .await
        .unwrap();
    let diff = machine.generate_diff(&base.id, &patched.id).unwrap();

    let change = &diff.balance_changes[&format_address(&fresh)];
    assert_eq!(change.old_balance, "0x0");
    assert_eq!(change.new_balance, "0x1");
    assert_eq!(change.delta.as_deref(), Some("+1"));
    assert!(diff.storage_changes.is_empty());

    let sarif: serde_json::Value =
        serde_json::from_str(&machine.render_diff(&base.id, &patched.id, "sarif").unwrap()).unwrap();
    assert_eq!(sarif["runs"][0]["results"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn test_failed_patch_persists_nothing() {
    init::init_test_environment(false);
    let machine = engine::in_memory().unwrap();
    let refused = Address::repeat_byte(0x22);
    let config = MockChainConfig::default().reject_patches_for(refused);
    machine.controller().register_adapter(
        "strict",
        Arc::new(move || Box::new(MockChainAdapter::new(config.clone())) as Box<dyn VmAdapter>),
    );
    let base = engine::replay_mock_chain(&machine).await.unwrap();
    let snapshots = machine.store().len();
    let branches = machine.branches().len();

    let patch = Patch::new("half")
        .with_operation(PatchOperation::balance(&Address::repeat_byte(0x11), U256::from(1u64)))
        .with_operation(PatchOperation::balance(&refused, U256::from(1u64)));
    let err = machine.apply_patch_with("strict", &base.id, &patch).await.unwrap_err();

    assert!(matches!(err, TimeMachineError::Conflict(_)));
    assert_eq!(machine.store().len(), snapshots);
    assert_eq!(machine.branches().len(), branches);
}

#[tokio::test]
async fn test_invalid_patch_reports_every_error() {
    init::init_test_environment(false);
    let machine = engine::in_memory().unwrap();
    let mut bad_target = PatchOperation::nonce(&Address::ZERO, 1);
    bad_target.target_address = "not-an-address".into();
    let mut bad_nonce = PatchOperation::nonce(&Address::ZERO, 1);
    bad_nonce.value = json!("many");
    let patch = Patch::new("broken").with_operation(bad_target).with_operation(bad_nonce);

    let report = machine.validate_patch(&patch);
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 2);

    let base = machine.import_state("base", &sample_state(1), 1).unwrap();
    let err = machine.apply_patch(&base.id, &patch).await.unwrap_err();
    assert!(matches!(err, TimeMachineError::Validation(_)));
    assert_eq!(machine.branches().len(), 1);
}

#[test]
fn test_numeric_fields_compare_by_value() {
    init::init_test_environment(false);
    let from = sample_state(5);
    let mut to = from.clone();
    to.set_timestamp(from.timestamp().unwrap() + 12);
    let diff = generate(&from, &to, &DiffOptions::default());
    let timestamp = diff.changes.iter().find(|c| c.path == "timestamp").unwrap();
    assert_eq!(timestamp.change_type, ChangeType::Modified);
    assert_eq!(timestamp.delta.as_deref(), Some("+12"));
}
