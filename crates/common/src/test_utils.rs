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

//! Test utilities for building states and isolated data directories.

use std::{env, path::PathBuf, sync::OnceLock};

use alloy_primitives::{address, Address, Bytes, U256};
use tracing::info;

use crate::State;

/// First well-known test account.
pub const ALICE: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
/// Second well-known test account.
pub const BOB: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
/// A contract-like test account.
pub const VAULT: Address = address!("0xcccccccccccccccccccccccccccccccccccccccc");

/// A small state: two funded accounts and a contract with one storage slot.
pub fn sample_state(block_number: u64) -> State {
    let mut state = State::new();
    state.set_block_number(block_number);
    state.set_timestamp(1_700_000_000 + block_number * 12);
    state.set_gas_used(21_000);
    state.set_logs(Vec::new());
    state.set_balance(&ALICE, U256::from(1_000u64));
    state.set_balance(&BOB, U256::ZERO);
    state.set_code(&VAULT, &Bytes::from_static(&[0x60, 0x80, 0x60, 0x40, 0x52]));
    state.set_storage(&VAULT, U256::ZERO, U256::from(1u64));
    state
}

/// Creates a fresh, empty directory under the system temp location.
pub fn create_temp_data_dir() -> PathBuf {
    let suffix: u32 = rand::random();
    let dir = env::temp_dir().join(format!("rewind-test-data-{suffix:08x}"));
    if let Err(err) = std::fs::create_dir_all(&dir) {
        panic!("failed to create temp data directory {}: {err}", dir.display());
    }
    info!("Created temporary test data directory: {}", dir.display());
    dir
}

static TEST_ENV_INITIALIZED: OnceLock<PathBuf> = OnceLock::new();

/// Points [`REWIND_DATA_DIR`](crate::env::REWIND_DATA_DIR) at a per-process temp directory.
///
/// Only the first call has an effect; the directory is returned on every call.
pub fn setup_test_environment() -> PathBuf {
    TEST_ENV_INITIALIZED
        .get_or_init(|| {
            let dir = create_temp_data_dir();
            env::set_var(crate::env::REWIND_DATA_DIR, &dir);
            dir
        })
        .clone()
}
