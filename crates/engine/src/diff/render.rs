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

//! Export formats of a [`Diff`].

use std::fmt::Write;

use itertools::Itertools;
use rewind_common::{Diff, DiffFormat, Result, StorageError, TimeMachineError};
use serde_json::{json, Value};

/// SARIF rule id of a storage change result.
const STORAGE_RULE: &str = "storage-change";

/// Renders `diff` in the format named by `format`; unknown names are a validation error.
pub fn render(diff: &Diff, format: &str) -> Result<String> {
    render_as(diff, format.parse()?)
}

/// Renders `diff` in `format`.
pub fn render_as(diff: &Diff, format: DiffFormat) -> Result<String> {
    match format {
        DiffFormat::Json => to_pretty(&diff),
        DiffFormat::Sarif => to_pretty(&sarif(diff)),
        DiffFormat::Html => Ok(html(diff)),
        DiffFormat::Text => Ok(text(diff)),
        DiffFormat::Compact => Ok(compact(diff)),
    }
}

fn to_pretty<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|err| TimeMachineError::Storage(StorageError::from(err)))
}

fn network(diff: &Diff) -> &str {
    diff.metadata.get("network").and_then(Value::as_str).unwrap_or("mainnet")
}

fn show(value: Option<&Value>) -> String {
    match value {
        None => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// SARIF 2.1.0 log with one result per storage change.
pub fn sarif(diff: &Diff) -> Value {
    let network = network(diff);
    let results: Vec<Value> = diff
        .storage_changes
        .iter()
        .flat_map(|(address, slots)| slots.iter().map(move |(slot, c)| (address, slot, c)))
        .map(|(address, slot, change)| {
            json!({
                "ruleId": STORAGE_RULE,
                "level": "note",
                "message": {
                    "text": format!(
                        "storage slot {slot} of {address} {}: {} -> {}",
                        change.change_type.to_string().to_lowercase(),
                        show(change.old_value.as_ref()),
                        show(change.new_value.as_ref()),
                    )
                },
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": { "uri": format!("chain://{network}/address/{address}") }
                    },
                    "logicalLocations": [{ "name": slot, "kind": "member" }]
                }],
                "properties": {
                    "changeType": change.change_type,
                    "oldValue": change.old_value,
                    "newValue": change.new_value,
                }
            })
        })
        .collect();

    json!({
        "$schema": "https://json.schemastore.org/sarif-2.1.0.json",
        "version": "2.1.0",
        "runs": [{
            "tool": {
                "driver": {
                    "name": "rewind",
                    "version": env!("CARGO_PKG_VERSION"),
                    "rules": [{
                        "id": STORAGE_RULE,
                        "shortDescription": { "text": "Contract storage slot changed between two states" }
                    }]
                }
            },
            "properties": {
                "fromBranch": diff.from_branch_id,
                "toBranch": diff.to_branch_id,
                "totalChanges": diff.statistics.total_changes,
            },
            "results": results
        }]
    })
}

fn summary(diff: &Diff) -> String {
    let s = &diff.statistics;
    format!(
        "{} changes ({} added, {} removed, {} modified) across {} addresses",
        s.total_changes, s.added, s.removed, s.modified, s.addresses_affected
    )
}

fn text(diff: &Diff) -> String {
    let mut out = String::new();
    let from = diff.from_branch_id.as_ref().map_or("-", |b| b.as_str());
    let to = diff.to_branch_id.as_ref().map_or("-", |b| b.as_str());
    let _ = writeln!(out, "State diff {from} -> {to}");
    let _ = writeln!(out, "{}", summary(diff));

    if !diff.balance_changes.is_empty() {
        let _ = writeln!(out, "\nBalances:");
        for (address, change) in &diff.balance_changes {
            let _ = writeln!(
                out,
                "  {address}: {} -> {} ({})",
                change.old_balance,
                change.new_balance,
                change.delta.as_deref().unwrap_or("?")
            );
        }
    }
    if !diff.nonce_changes.is_empty() {
        let _ = writeln!(out, "\nNonces:");
        for (address, change) in &diff.nonce_changes {
            let _ = writeln!(
                out,
                "  {address}: {} -> {}",
                show(change.old_nonce.as_ref()),
                show(change.new_nonce.as_ref())
            );
        }
    }
    if !diff.code_changes.is_empty() {
        let _ = writeln!(out, "\nCode:");
        for (address, change) in &diff.code_changes {
            let _ = writeln!(out, "  {address}: {}", change.change_type);
        }
    }
    if !diff.storage_changes.is_empty() {
        let _ = writeln!(out, "\nStorage:");
        for (address, slots) in &diff.storage_changes {
            let _ = writeln!(out, "  {address}");
            for (slot, change) in slots {
                let _ = writeln!(
                    out,
                    "    {slot}: {} -> {} [{}]",
                    show(change.old_value.as_ref()),
                    show(change.new_value.as_ref()),
                    change.change_type
                );
            }
        }
    }
    if !diff.log_changes.is_empty() {
        let _ = writeln!(
            out,
            "\nLogs: {} added, {} removed",
            diff.log_changes.added.len(),
            diff.log_changes.removed.len()
        );
    }
    for (field, change) in &diff.gas_changes {
        let _ = writeln!(
            out,
            "\nGas {field}: {} -> {}",
            show(change.old_value.as_ref()),
            show(change.new_value.as_ref())
        );
    }
    out
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn html(diff: &Diff) -> String {
    let mut out = String::from("<div class=\"rewind-diff\">\n");
    let _ = writeln!(out, "  <p class=\"summary\">{}</p>", escape(&summary(diff)));
    let _ = writeln!(
        out,
        "  <table>\n    <thead><tr><th>Path</th><th>Change</th><th>Old</th><th>New</th><th>Delta</th></tr></thead>\n    <tbody>"
    );
    for change in diff.effective_changes() {
        let kind = change.change_type.to_string().to_lowercase();
        let _ = writeln!(
            out,
            "      <tr class=\"{kind}\"><td><code>{}</code></td><td>{kind}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&change.path),
            escape(&show(change.old_value.as_ref())),
            escape(&show(change.new_value.as_ref())),
            escape(change.delta.as_deref().unwrap_or("")),
        );
    }
    out.push_str("    </tbody>\n  </table>\n</div>\n");
    out
}

fn compact(diff: &Diff) -> String {
    let s = &diff.statistics;
    let buckets = [
        ("storage", s.storage_changes),
        ("balance", s.balance_changes),
        ("code", s.code_changes),
        ("nonce", s.nonce_changes),
        ("logs", s.log_changes),
        ("gas", s.gas_changes),
    ];
    let detail = buckets
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(name, n)| format!("{name}={n}"))
        .join(" ");
    if detail.is_empty() {
        format!("+{} -{} ~{} | {} addrs", s.added, s.removed, s.modified, s.addresses_affected)
    } else {
        format!(
            "+{} -{} ~{} | {} addrs | {detail}",
            s.added, s.removed, s.modified, s.addresses_affected
        )
    }
}
