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

//! Changed-key deltas between two state trees.
//!
//! A delta lists only the leaves that differ, each addressed by its key path from the
//! root. Objects present on both sides are descended into; anything else that differs is
//! replaced wholesale, so arrays such as `logs` are stored in full when they change.

use rewind_common::State;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What happens at one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    /// Write the value, creating parent objects
    Set(Value),
    /// Remove the key
    Remove,
}

/// One changed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Key path from the root
    pub path: Vec<String>,
    /// Change at that path
    pub op: DeltaOp,
}

/// Ordered list of changed paths turning a parent state into a child state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Changes, in key order
    pub entries: Vec<DeltaEntry>,
}

impl Delta {
    /// Computes the delta turning `from` into `to`.
    pub fn between(from: &State, to: &State) -> Self {
        let mut entries = Vec::new();
        let mut path = Vec::new();
        walk(&mut path, from.as_value(), to.as_value(), &mut entries);
        Self { entries }
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of changed paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Applies the delta on top of `base`.
    pub fn apply(&self, base: &State) -> State {
        let mut state = base.clone();
        for entry in &self.entries {
            match &entry.op {
                DeltaOp::Set(value) => state.set_path(&entry.path, value.clone()),
                DeltaOp::Remove => {
                    state.remove_path(&entry.path);
                }
            }
        }
        state
    }
}

fn walk(path: &mut Vec<String>, from: &Value, to: &Value, out: &mut Vec<DeltaEntry>) {
    match (from, to) {
        (Value::Object(old), Value::Object(new)) => walk_objects(path, old, new, out),
        _ if from == to => {}
        _ => out.push(DeltaEntry { path: path.clone(), op: DeltaOp::Set(to.clone()) }),
    }
}

fn walk_objects(
    path: &mut Vec<String>,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    out: &mut Vec<DeltaEntry>,
) {
    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        path.push(key.clone());
        match (old.get(key), new.get(key)) {
            (Some(before), Some(after)) => walk(path, before, after, out),
            (None, Some(after)) => {
                out.push(DeltaEntry { path: path.clone(), op: DeltaOp::Set(after.clone()) })
            }
            (Some(_), None) => out.push(DeltaEntry { path: path.clone(), op: DeltaOp::Remove }),
            (None, None) => {}
        }
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use rewind_common::test_utils::{sample_state, ALICE, BOB, VAULT};
    use serde_json::json;

    #[test]
    fn test_identical_states_have_empty_delta() {
        let state = sample_state(100);
        assert!(Delta::between(&state, &state).is_empty());
    }

    #[test]
    fn test_delta_lists_changed_leaves_only() {
        let parent = sample_state(100);
        let mut child = parent.clone();
        child.set_balance(&ALICE, U256::from(7u64));
        child.set_storage(&VAULT, U256::from(3u64), U256::from(9u64));

        let delta = Delta::between(&parent, &child);
        assert_eq!(delta.len(), 2);
        assert!(delta.entries.iter().all(|e| e.path[0] == "accounts"));
        assert_eq!(delta.apply(&parent), child);
    }

    #[test]
    fn test_removed_account_and_header_change() {
        let parent = sample_state(100);
        let mut child = sample_state(101);
        child.remove_path(&["accounts".to_string(), rewind_common::format_address(&BOB)]);

        let delta = Delta::between(&parent, &child);
        assert!(delta.entries.iter().any(|e| e.op == DeltaOp::Remove));
        assert_eq!(delta.apply(&parent).content_hash(), child.content_hash());
    }

    #[test]
    fn test_delta_survives_serialization() {
        let parent = sample_state(100);
        let mut child = parent.clone();
        child.set_logs(vec![json!({"address": "0x01", "data": "0x"})]);

        let delta = Delta::between(&parent, &child);
        let decoded: Delta = serde_json::from_slice(&serde_json::to_vec(&delta).unwrap()).unwrap();
        assert_eq!(decoded.apply(&parent), child);
    }
}
