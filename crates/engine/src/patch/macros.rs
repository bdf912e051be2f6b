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

//! Named patch templates.
//!
//! A template is a list of operations whose strings may contain `{{param}}`
//! placeholders. Expansion substitutes every declared parameter and returns a concrete,
//! not yet validated [`Patch`]. A placeholder that is a whole string and whose
//! parameter is not a string is replaced by the JSON value itself, so numeric params
//! stay numeric.
//!
//! One computed placeholder is understood: `{{mapping_slot(key, slot)}}` yields the
//! storage slot of `mapping[key]` for a Solidity mapping declared at `slot`.

use std::collections::BTreeMap;

use alloy_primitives::{keccak256, B256, U256};
use parking_lot::RwLock;
use rewind_common::{
    format_word, parse_address, parse_quantity, EntityKind, OpType, Patch,
    PatchOperation, Result, TimeMachineError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

/// A named, parameterized list of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroTemplate {
    /// Name referenced by `macro` operations
    pub name: String,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Required parameters
    pub params: Vec<String>,
    /// Operations with placeholders
    pub operations: Vec<PatchOperation>,
}

impl MacroTemplate {
    /// Template named `name`.
    pub fn new(name: impl Into<String>, params: &[&str]) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            params: params.iter().map(|p| p.to_string()).collect(),
            operations: Vec::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends a templated operation.
    pub fn with_operation(
        mut self,
        op_type: OpType,
        target: &str,
        key: Option<&str>,
        value: Value,
    ) -> Self {
        self.operations.push(PatchOperation {
            op_type,
            target_address: target.to_string(),
            key: key.map(str::to_string),
            value,
            condition: None,
        });
        self
    }
}

fn builtin_templates() -> Vec<MacroTemplate> {
    vec![
        MacroTemplate::new("fund_account", &["address", "amount"])
            .with_description("Set the balance of an account")
            .with_operation(OpType::Balance, "{{address}}", None, json!("{{amount}}")),
        MacroTemplate::new("set_owner", &["contract", "owner"])
            .with_description("Overwrite the owner stored in slot 0 of an Ownable contract")
            .with_operation(
                OpType::Storage,
                "{{contract}}",
                Some(&format_word(U256::ZERO)),
                json!("{{owner}}"),
            ),
        MacroTemplate::new("etch_code", &["address", "code"])
            .with_description("Replace the runtime code of an account")
            .with_operation(OpType::Code, "{{address}}", None, json!("{{code}}")),
        MacroTemplate::new("drain_account", &["address"])
            .with_description("Zero the balance of an account")
            .with_operation(OpType::Balance, "{{address}}", None, json!("0x0")),
        MacroTemplate::new("set_erc20_balance", &["token", "holder", "balance", "slot"])
            .with_description("Write balances[holder] of an ERC-20 whose mapping lives at `slot`")
            .with_operation(
                OpType::Storage,
                "{{token}}",
                Some("{{mapping_slot(holder, slot)}}"),
                json!("{{balance}}"),
            ),
    ]
}

/// Storage slot of `mapping[key]` for a mapping declared at `slot`:
/// `keccak256(pad32(key) ++ pad32(slot))`.
pub fn mapping_slot(key: U256, slot: U256) -> U256 {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(B256::from(key).as_slice());
    preimage[32..].copy_from_slice(B256::from(slot).as_slice());
    U256::from_be_bytes(keccak256(preimage).0)
}

/// Registry of templates, seeded with the built-ins.
#[derive(Debug)]
pub struct MacroRegistry {
    templates: RwLock<BTreeMap<String, MacroTemplate>>,
}

impl Default for MacroRegistry {
    fn default() -> Self {
        let templates = builtin_templates().into_iter().map(|t| (t.name.clone(), t)).collect();
        Self { templates: RwLock::new(templates) }
    }
}

impl MacroRegistry {
    /// Registry with the built-in templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a template.
    pub fn register(&self, template: MacroTemplate) -> Result<()> {
        if template.name.trim().is_empty() {
            return Err(TimeMachineError::validation("macro name must not be empty"));
        }
        if template.operations.is_empty() {
            return Err(TimeMachineError::validation(format!(
                "macro '{}' has no operations",
                template.name
            )));
        }
        if let Some(op) = template.operations.iter().find(|op| op.op_type == OpType::Macro) {
            return Err(TimeMachineError::validation(format!(
                "macro '{}' may not call macro '{}'",
                template.name,
                op.key.as_deref().unwrap_or_default()
            )));
        }
        debug!(name = %template.name, "registered macro");
        self.templates.write().insert(template.name.clone(), template);
        Ok(())
    }

    /// Template named `name`.
    pub fn get(&self, name: &str) -> Option<MacroTemplate> {
        self.templates.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.templates.read().keys().cloned().collect()
    }

    /// Expands `name` with `params` into a concrete patch.
    pub fn expand(&self, name: &str, params: &Value) -> Result<Patch> {
        let template =
            self.get(name).ok_or_else(|| TimeMachineError::not_found(EntityKind::Macro, name))?;
        expand_template(&template, params)
    }
}

/// Substitutes `params` into every operation of `template`.
pub fn expand_template(template: &MacroTemplate, params: &Value) -> Result<Patch> {
    let empty = Map::new();
    let params = match params {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(TimeMachineError::validation(format!(
                "macro '{}' expects an object of parameters, got {}",
                template.name,
                rewind_common::kind_of(other)
            )))
        }
    };
    if let Some(missing) = template.params.iter().find(|p| !params.contains_key(p.as_str())) {
        return Err(TimeMachineError::validation(format!(
            "macro '{}' is missing parameter '{missing}'",
            template.name
        )));
    }

    let mut patch = Patch::new(template.name.clone()).with_description(template.description.clone());
    for op in &template.operations {
        let raw = serde_json::to_value(op)
            .map_err(|e| TimeMachineError::validation(format!("macro '{}': {e}", template.name)))?;
        let substituted = substitute(&raw, params).map_err(|e| {
            TimeMachineError::validation(format!("macro '{}': {e}", template.name))
        })?;
        let operation: PatchOperation = serde_json::from_value(substituted)
            .map_err(|e| TimeMachineError::validation(format!("macro '{}': {e}", template.name)))?;
        patch.operations.push(operation);
    }
    Ok(patch)
}

fn substitute(value: &Value, params: &Map<String, Value>) -> std::result::Result<Value, String> {
    match value {
        Value::String(text) => substitute_str(text, params),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, params))
            .collect::<std::result::Result<_, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, params)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str(text: &str, params: &Map<String, Value>) -> std::result::Result<Value, String> {
    // A lone placeholder keeps the parameter's JSON type.
    if let Some(inner) = text.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
        if !inner.contains("{{") {
            return resolve(inner.trim(), params);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| format!("unterminated placeholder in '{text}'"))?;
        match resolve(after[..end].trim(), params)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn resolve(expr: &str, params: &Map<String, Value>) -> std::result::Result<Value, String> {
    if let Some(args) = expr.strip_prefix("mapping_slot(").and_then(|a| a.strip_suffix(')')) {
        let (key, slot) = args
            .split_once(',')
            .ok_or_else(|| format!("mapping_slot expects two arguments, got '{args}'"))?;
        let key = word_param(key.trim(), params)?;
        let slot = word_param(slot.trim(), params)?;
        return Ok(Value::String(format_word(mapping_slot(key, slot))));
    }
    params.get(expr).cloned().ok_or_else(|| format!("unresolved placeholder '{{{{{expr}}}}}'"))
}

/// A parameter usable as a 32-byte word: an address or a quantity.
fn word_param(name: &str, params: &Map<String, Value>) -> std::result::Result<U256, String> {
    let value = params.get(name).ok_or_else(|| format!("unresolved placeholder '{name}'"))?;
    if let Some(address) = value.as_str().and_then(parse_address) {
        return Ok(U256::from_be_slice(address.as_slice()));
    }
    parse_quantity(value)
        .ok_or_else(|| format!("parameter '{name}' is neither an address nor a number"))
}
