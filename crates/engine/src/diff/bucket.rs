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

//! Sorting classified changes into per-address buckets.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use rewind_common::{
    is_address_like, parse_quantity, signed_delta, BalanceChange, Change, ChangeType, CodeChange,
    DiffStatistics, GasChange, LogChanges, NonceChange, StorageChange,
};
use serde_json::Value;

use super::compare::Leaf;

/// Top-level fields reported as gas changes.
const GAS_FIELDS: [&str; 2] = ["gas_used", "gas"];

#[derive(Debug, Default)]
pub(crate) struct Buckets {
    pub storage: BTreeMap<String, BTreeMap<String, StorageChange>>,
    pub balance: BTreeMap<String, BalanceChange>,
    pub code: BTreeMap<String, CodeChange>,
    pub nonce: BTreeMap<String, NonceChange>,
    pub logs: LogChanges,
    pub gas: BTreeMap<String, GasChange>,
}

enum Field<'a> {
    Storage(&'a str),
    Balance,
    Code,
    Nonce,
}

/// Finds the first address-like segment and the keyword following it.
fn locate(segments: &[String]) -> Option<(String, Field<'_>)> {
    let at = segments.iter().position(|s| is_address_like(s))?;
    let address = segments[at].to_ascii_lowercase();
    let rest: Vec<&str> = segments[at + 1..].iter().map(String::as_str).collect();
    let field = match rest.as_slice() {
        ["storage" | "slot", slot, ..] => Field::Storage(*slot),
        ["balance", ..] => Field::Balance,
        ["code" | "bytecode", ..] => Field::Code,
        ["nonce", ..] => Field::Nonce,
        _ => return None,
    };
    Some((address, field))
}

fn text(value: Option<&Value>) -> Option<String> {
    value.map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

pub(crate) fn bucket(leaves: &[Leaf], old: &Value, new: &Value) -> Buckets {
    let mut buckets = Buckets::default();

    let effective = leaves.iter().filter(|l| l.change.change_type != ChangeType::Unchanged);
    for Leaf { segments, change } in effective {
        let Some((address, field)) = locate(segments) else { continue };
        match field {
            Field::Storage(slot) => {
                buckets.storage.entry(address).or_default().insert(
                    slot.to_ascii_lowercase(),
                    StorageChange {
                        change_type: change.change_type,
                        old_value: change.old_value.clone(),
                        new_value: change.new_value.clone(),
                    },
                );
            }
            Field::Balance => {
                let old_balance = text(change.old_value.as_ref()).unwrap_or_else(|| "0x0".into());
                let new_balance = text(change.new_value.as_ref()).unwrap_or_else(|| "0x0".into());
                buckets.balance.insert(
                    address,
                    BalanceChange { old_balance, new_balance, delta: change.delta.clone() },
                );
            }
            Field::Code => {
                buckets.code.insert(
                    address,
                    CodeChange {
                        change_type: change.change_type,
                        old_code: text(change.old_value.as_ref()),
                        new_code: text(change.new_value.as_ref()),
                    },
                );
            }
            Field::Nonce => {
                buckets.nonce.insert(
                    address,
                    NonceChange {
                        old_nonce: change.old_value.clone(),
                        new_nonce: change.new_value.clone(),
                        delta: change.delta.clone(),
                    },
                );
            }
        }
    }

    buckets.logs = log_changes(old.get("logs"), new.get("logs"));
    for field in GAS_FIELDS {
        if let Some(change) = gas_change(old.get(field), new.get(field)) {
            buckets.gas.insert(field.to_string(), change);
        }
    }
    buckets
}

fn log_changes(old: Option<&Value>, new: Option<&Value>) -> LogChanges {
    let empty = Vec::new();
    let old = old.and_then(Value::as_array).unwrap_or(&empty);
    let new = new.and_then(Value::as_array).unwrap_or(&empty);
    LogChanges {
        added: new.iter().filter(|log| !old.contains(log)).cloned().collect(),
        removed: old.iter().filter(|log| !new.contains(log)).cloned().collect(),
    }
}

fn gas_change(old: Option<&Value>, new: Option<&Value>) -> Option<GasChange> {
    if old == new {
        return None;
    }
    let numeric = (old.map(parse_quantity), new.map(parse_quantity));
    let delta = match numeric {
        (Some(Some(a)), Some(Some(b))) if a == b => return None,
        (Some(Some(a)), Some(Some(b))) => Some(signed_delta(a, b)),
        _ => None,
    };
    Some(GasChange { old_value: old.cloned(), new_value: new.cloned(), delta })
}

pub(crate) fn statistics(changes: &[Change], buckets: &Buckets) -> DiffStatistics {
    let counts = changes.iter().counts_by(|c| c.change_type);
    let count = |kind: ChangeType| counts.get(&kind).copied().unwrap_or_default();

    let addresses: BTreeSet<&String> = buckets
        .storage
        .keys()
        .chain(buckets.balance.keys())
        .chain(buckets.code.keys())
        .chain(buckets.nonce.keys())
        .collect();

    let added = count(ChangeType::Added);
    let removed = count(ChangeType::Removed);
    let modified = count(ChangeType::Modified);
    DiffStatistics {
        total_changes: added + removed + modified,
        added,
        removed,
        modified,
        unchanged: count(ChangeType::Unchanged),
        addresses_affected: addresses.len(),
        storage_changes: buckets.storage.values().map(BTreeMap::len).sum(),
        balance_changes: buckets.balance.len(),
        code_changes: buckets.code.len(),
        nonce_changes: buckets.nonce.len(),
        log_changes: buckets.logs.added.len() + buckets.logs.removed.len(),
        gas_changes: buckets.gas.len(),
    }
}
