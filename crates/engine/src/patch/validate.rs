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

//! Batch validation of patch documents.
//!
//! Every operation is checked and every problem is reported; nothing stops at the first
//! error. `macro` operations are expanded first and their expansion is validated like
//! any other operation.

use rewind_common::{
    is_address_like, parse_bytes, parse_quantity, parse_slot, parse_u64, OpType, Patch,
    PatchOperation, ValidationReport,
};
use serde_json::Value;

use super::{Condition, MacroRegistry};

/// Validates `patch`, expanding macros through `macros`.
pub fn validate_patch(patch: &Patch, macros: &MacroRegistry) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if patch.name.trim().is_empty() {
        warnings.push("patch has no name".to_string());
    }
    if patch.operations.is_empty() {
        errors.push("patch has no operations".to_string());
    }

    for (index, op) in patch.operations.iter().enumerate() {
        let label = format!("operation {index}");
        if op.op_type == OpType::Macro {
            validate_macro(&label, op, macros, &mut errors, &mut warnings);
        } else {
            validate_operation(&label, op, &mut errors, &mut warnings);
        }
    }

    ValidationReport::new(errors, warnings)
}

fn validate_macro(
    label: &str,
    op: &PatchOperation,
    macros: &MacroRegistry,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let Some(name) = op.key.as_deref().filter(|k| !k.trim().is_empty()) else {
        errors.push(format!("{label}: macro operation needs the macro name in 'key'"));
        return;
    };
    if op.condition.is_some() {
        warnings.push(format!("{label}: conditions on macro '{name}' are ignored"));
    }
    match macros.expand(name, &op.value) {
        Ok(expanded) => {
            for (inner, expanded_op) in expanded.operations.iter().enumerate() {
                let inner_label = format!("{label} (macro '{name}' op {inner})");
                validate_operation(&inner_label, expanded_op, errors, warnings);
            }
        }
        Err(err) => errors.push(format!("{label}: {err}")),
    }
}

fn validate_operation(
    label: &str,
    op: &PatchOperation,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if let OpType::Unknown(other) = &op.op_type {
        errors.push(format!("{label}: unknown op_type '{other}'"));
        return;
    }

    if !is_address_like(&op.target_address) {
        errors.push(format!("{label}: malformed target address '{}'", op.target_address));
    }

    match op.op_type {
        OpType::Set => match op.key.as_deref() {
            None | Some("") => errors.push(format!("{label}: set needs a field path in 'key'")),
            Some(key) if key.split('.').any(str::is_empty) => {
                errors.push(format!("{label}: malformed field path '{key}'"))
            }
            Some(_) if op.value.is_null() => errors.push(format!("{label}: set needs a value")),
            Some(_) => {}
        },
        OpType::Balance => match parse_quantity(&op.value) {
            Some(balance) if balance.is_zero() => {
                warnings.push(format!("{label}: sets balance of {} to zero", op.target_address))
            }
            Some(_) => {}
            None => errors.push(format!("{label}: balance {} is not a quantity", show(&op.value))),
        },
        OpType::Storage => {
            match op.key.as_deref() {
                Some(key) if parse_slot(key).is_some() => {}
                Some(key) => errors.push(format!("{label}: malformed storage slot '{key}'")),
                None => errors.push(format!("{label}: storage needs a slot in 'key'")),
            }
            if parse_quantity(&op.value).is_none() {
                errors.push(format!("{label}: storage value {} is not a word", show(&op.value)));
            }
        }
        OpType::Code => match op.value.as_str().and_then(parse_bytes) {
            Some(code) if code.is_empty() => {
                warnings.push(format!("{label}: clears the code of {}", op.target_address))
            }
            Some(_) => {}
            None => errors.push(format!("{label}: code {} is not hex bytes", show(&op.value))),
        },
        OpType::Nonce => {
            if parse_u64(&op.value).is_none() {
                errors.push(format!("{label}: nonce {} is not an integer", show(&op.value)));
            }
        }
        OpType::Macro | OpType::Unknown(_) => {}
    }

    if let Some(condition) = &op.condition {
        if let Err(err) = condition.parse::<Condition>() {
            errors.push(format!("{label}: {err}"));
        }
    }
}

fn show(value: &Value) -> String {
    match value {
        Value::Null => "(missing)".to_string(),
        other => other.to_string(),
    }
}
