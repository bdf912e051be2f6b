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

//! Recursive leaf classification.

use alloy_primitives::U256;
use rewind_common::{parse_quantity, signed_delta, Change, ChangeType};
use serde_json::{Map, Value};

/// Leaf names compared numerically.
const NUMERIC_FIELDS: [&str; 6] =
    ["balance", "nonce", "gas", "gas_used", "timestamp", "block_number"];

/// A classified leaf with the unjoined key path it was found at.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    /// Object keys from the root; keys may themselves contain dots
    pub segments: Vec<String>,
    pub change: Change,
}

/// Walks two JSON trees and classifies every leaf.
///
/// Objects are descended into while `depth < max_depth`; arrays and scalars are leaves.
/// A path present on one side only is ADDED or REMOVED. When one side is an object and
/// the other is missing, the object's leaves are reported individually.
pub(crate) fn compare(
    old: &Value,
    new: &Value,
    max_depth: usize,
    include_unchanged: bool,
) -> Vec<Leaf> {
    let mut walker = Walker { max_depth, include_unchanged, path: Vec::new(), leaves: Vec::new() };
    walker.objects(old.as_object(), new.as_object(), 0);
    walker.leaves
}

struct Walker<'a> {
    max_depth: usize,
    include_unchanged: bool,
    path: Vec<&'a str>,
    leaves: Vec<Leaf>,
}

impl<'a> Walker<'a> {
    fn objects(
        &mut self,
        old: Option<&'a Map<String, Value>>,
        new: Option<&'a Map<String, Value>>,
        depth: usize,
    ) {
        let mut keys: Vec<&'a String> = old.into_iter().chain(new).flat_map(Map::keys).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            self.path.push(key);
            self.entry(old.and_then(|m| m.get(key)), new.and_then(|m| m.get(key)), depth + 1);
            self.path.pop();
        }
    }

    fn entry(&mut self, old: Option<&'a Value>, new: Option<&'a Value>, depth: usize) {
        let descend = depth < self.max_depth
            && match (old, new) {
                (Some(Value::Object(_)), Some(Value::Object(_)))
                | (Some(Value::Object(_)), None)
                | (None, Some(Value::Object(_))) => true,
                _ => false,
            };
        if descend {
            self.objects(old.and_then(Value::as_object), new.and_then(Value::as_object), depth);
        } else {
            self.leaf(old, new);
        }
    }

    fn leaf(&mut self, old: Option<&Value>, new: Option<&Value>) {
        let (change_type, delta) = match (old, new) {
            (None, None) => return,
            (None, Some(_)) => (ChangeType::Added, None),
            (Some(_), None) => (ChangeType::Removed, None),
            (Some(old), Some(new)) => self.classify(old, new),
        };
        if change_type == ChangeType::Unchanged && !self.include_unchanged {
            return;
        }
        let delta = match (old, new) {
            (None, Some(new)) if self.is_numeric_field() => {
                parse_quantity(new).map(|n| signed_delta(U256::ZERO, n))
            }
            (Some(old), None) if self.is_numeric_field() => {
                parse_quantity(old).map(|n| signed_delta(n, U256::ZERO))
            }
            _ => delta,
        };
        self.leaves.push(Leaf {
            segments: self.path.iter().map(|s| s.to_string()).collect(),
            change: Change {
                path: self.path.join("."),
                change_type,
                old_value: old.cloned(),
                new_value: new.cloned(),
                delta,
            },
        });
    }

    fn classify(&self, old: &Value, new: &Value) -> (ChangeType, Option<String>) {
        if self.is_numeric_field() {
            if let (Some(a), Some(b)) = (parse_quantity(old), parse_quantity(new)) {
                let change_type = if a == b { ChangeType::Unchanged } else { ChangeType::Modified };
                return (change_type, Some(signed_delta(a, b)));
            }
        }
        let change_type = if old == new { ChangeType::Unchanged } else { ChangeType::Modified };
        (change_type, None)
    }

    fn is_numeric_field(&self) -> bool {
        self.path.last().is_some_and(|field| NUMERIC_FIELDS.contains(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changes(old: &Value, new: &Value, max_depth: usize, unchanged: bool) -> Vec<Change> {
        compare(old, new, max_depth, unchanged).into_iter().map(|leaf| leaf.change).collect()
    }

    fn paths(changes: &[Change]) -> Vec<(&str, ChangeType)> {
        changes.iter().map(|c| (c.path.as_str(), c.change_type)).collect()
    }

    #[test]
    fn test_classification() {
        let old = json!({"a": 1, "b": {"c": "x", "d": [1, 2]}, "gone": true});
        let new = json!({"a": 1, "b": {"c": "y", "d": [1, 2, 3]}, "fresh": {"deep": 1}});
        let changes = changes(&old, &new, 32, false);
        assert_eq!(
            paths(&changes),
            vec![
                ("b.c", ChangeType::Modified),
                ("b.d", ChangeType::Modified),
                ("fresh.deep", ChangeType::Added),
                ("gone", ChangeType::Removed),
            ]
        );
    }

    #[test]
    fn test_numeric_fields_compare_by_value() {
        let old = json!({"balance": "0x10", "nonce": "0x1", "label": "0x10"});
        let new = json!({"balance": "16", "nonce": 3, "label": "16"});
        let changes = changes(&old, &new, 32, true);
        let balance = changes.iter().find(|c| c.path == "balance").unwrap();
        assert_eq!(balance.change_type, ChangeType::Unchanged);
        let nonce = changes.iter().find(|c| c.path == "nonce").unwrap();
        assert_eq!(nonce.delta.as_deref(), Some("+2"));
        let label = changes.iter().find(|c| c.path == "label").unwrap();
        assert_eq!(label.change_type, ChangeType::Modified);
        assert!(label.delta.is_none());
    }

    #[test]
    fn test_numeric_parse_failure_falls_back_to_equality() {
        let changes = changes(&json!({"gas": "lots"}), &json!({"gas": "lots"}), 32, true);
        assert_eq!(changes[0].change_type, ChangeType::Unchanged);
        assert!(changes[0].delta.is_none());
    }

    #[test]
    fn test_depth_limit_compares_subtrees_whole() {
        let old = json!({"a": {"b": {"c": 1}}});
        let new = json!({"a": {"b": {"c": 2}}});
        assert_eq!(paths(&changes(&old, &new, 1, false)), vec![("a", ChangeType::Modified)]);
        assert_eq!(paths(&changes(&old, &new, 32, false)), vec![("a.b.c", ChangeType::Modified)]);
    }

    #[test]
    fn test_dotted_keys_stay_single_segments() {
        let leaves = compare(&json!({}), &json!({"notes": {"v1.2": 1}}), 32, false);
        assert_eq!(leaves[0].segments, vec!["notes".to_string(), "v1.2".to_string()]);
        assert_eq!(leaves[0].change.path, "notes.v1.2");
    }

    #[test]
    fn test_self_comparison_is_empty() {
        let state = json!({"accounts": {"0xaa": {"balance": "0x1"}}, "logs": [{"x": 1}]});
        assert!(compare(&state, &state, 32, false).is_empty());
        assert!(changes(&state, &state, 32, true)
            .iter()
            .all(|c| c.change_type == ChangeType::Unchanged));
    }
}
