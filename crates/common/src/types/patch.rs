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

//! Patch documents and the typed state mutations they lower to.
//!
//! A patch is kept in its loosely typed document form (`op_type` is any string,
//! `value` is any JSON) so that validation can report every problem of a batch at
//! once. Adapters only ever see a [`StateMutation`], produced by
//! [`PatchOperation::to_mutation`] after validation.

use std::fmt;

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{parse_address, parse_bytes, parse_quantity, parse_slot, parse_u64, PatchId, State};

/// Kind of a patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OpType {
    /// Write an arbitrary account field addressed by `key`
    Set,
    /// Overwrite the balance
    Balance,
    /// Overwrite one storage slot
    Storage,
    /// Overwrite runtime code
    Code,
    /// Overwrite the nonce
    Nonce,
    /// Expand a named template
    Macro,
    /// Anything else; always a validation error
    Unknown(String),
}

impl From<String> for OpType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "set" => Self::Set,
            "balance" => Self::Balance,
            "storage" => Self::Storage,
            "code" => Self::Code,
            "nonce" => Self::Nonce,
            "macro" => Self::Macro,
            _ => Self::Unknown(value),
        }
    }
}

impl From<OpType> for String {
    fn from(value: OpType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => f.write_str("set"),
            Self::Balance => f.write_str("balance"),
            Self::Storage => f.write_str("storage"),
            Self::Code => f.write_str("code"),
            Self::Nonce => f.write_str("nonce"),
            Self::Macro => f.write_str("macro"),
            Self::Unknown(other) => f.write_str(other),
        }
    }
}

/// One entry of a patch document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    /// Operation kind
    pub op_type: OpType,
    /// Account the operation targets
    #[serde(default)]
    pub target_address: String,
    /// Field path for `set`, slot for `storage`, template name for `macro`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// New value, or template parameters for `macro`
    #[serde(default)]
    pub value: Value,
    /// Guard evaluated against the source state; a false guard skips the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl PatchOperation {
    fn new(op_type: OpType, target: &Address, key: Option<String>, value: Value) -> Self {
        Self {
            op_type,
            target_address: crate::format_address(target),
            key,
            value,
            condition: None,
        }
    }

    /// `balance` operation.
    pub fn balance(target: &Address, balance: U256) -> Self {
        Self::new(OpType::Balance, target, None, Value::String(crate::format_quantity(balance)))
    }

    /// `nonce` operation.
    pub fn nonce(target: &Address, nonce: u64) -> Self {
        Self::new(OpType::Nonce, target, None, Value::from(nonce))
    }

    /// `code` operation.
    pub fn code(target: &Address, code: &Bytes) -> Self {
        Self::new(OpType::Code, target, None, Value::String(code.to_string()))
    }

    /// `storage` operation.
    pub fn storage(target: &Address, slot: U256, value: U256) -> Self {
        Self::new(
            OpType::Storage,
            target,
            Some(crate::format_word(slot)),
            Value::String(crate::format_word(value)),
        )
    }

    /// `set` operation on a dotted account field path.
    pub fn set(target: &Address, key: impl Into<String>, value: Value) -> Self {
        Self::new(OpType::Set, target, Some(key.into()), value)
    }

    /// `macro` operation; `target_address` is unused by templates.
    pub fn macro_call(name: impl Into<String>, params: Value) -> Self {
        Self {
            op_type: OpType::Macro,
            target_address: String::new(),
            key: Some(name.into()),
            value: params,
            condition: None,
        }
    }

    /// Attaches a guard.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Lowers the document form into a typed mutation.
    pub fn to_mutation(&self) -> Result<StateMutation, String> {
        let address = parse_address(&self.target_address)
            .ok_or_else(|| format!("malformed target address '{}'", self.target_address))?;
        match &self.op_type {
            OpType::Balance => parse_quantity(&self.value)
                .map(|value| StateMutation::Balance { address, value })
                .ok_or_else(|| format!("balance value {} is not a quantity", self.value)),
            OpType::Nonce => parse_u64(&self.value)
                .map(|nonce| StateMutation::Nonce { address, nonce })
                .ok_or_else(|| format!("nonce value {} is not an integer", self.value)),
            OpType::Code => self
                .value
                .as_str()
                .and_then(parse_bytes)
                .map(|code| StateMutation::Code { address, code })
                .ok_or_else(|| format!("code value {} is not hex bytes", self.value)),
            OpType::Storage => {
                let key = self.key.as_deref().unwrap_or_default();
                let slot = parse_slot(key).ok_or_else(|| format!("malformed storage slot '{key}'"))?;
                let value = parse_quantity(&self.value)
                    .ok_or_else(|| format!("storage value {} is not a word", self.value))?;
                Ok(StateMutation::Storage { address, slot, value })
            }
            OpType::Set => {
                let key = self.key.as_deref().unwrap_or_default();
                let path: Vec<String> = key.split('.').map(str::to_string).collect();
                if path.iter().any(String::is_empty) {
                    return Err(format!("malformed field path '{key}'"));
                }
                Ok(StateMutation::Set { address, path, value: self.value.clone() })
            }
            OpType::Macro => Err("macro operations must be expanded before application".into()),
            OpType::Unknown(other) => Err(format!("unknown op_type '{other}'")),
        }
    }
}

/// A typed, single-account state mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StateMutation {
    /// Overwrite a balance
    Balance {
        /// Target account
        address: Address,
        /// New balance
        value: U256,
    },
    /// Overwrite a nonce
    Nonce {
        /// Target account
        address: Address,
        /// New nonce
        nonce: u64,
    },
    /// Overwrite runtime code
    Code {
        /// Target account
        address: Address,
        /// New code
        code: Bytes,
    },
    /// Overwrite a storage word
    Storage {
        /// Target account
        address: Address,
        /// Slot
        slot: U256,
        /// New word
        value: U256,
    },
    /// Write a field of the account object by path
    Set {
        /// Target account
        address: Address,
        /// Path below the account object
        path: Vec<String>,
        /// New value
        value: Value,
    },
}

impl StateMutation {
    /// Target account.
    pub fn address(&self) -> &Address {
        match self {
            Self::Balance { address, .. }
            | Self::Nonce { address, .. }
            | Self::Code { address, .. }
            | Self::Storage { address, .. }
            | Self::Set { address, .. } => address,
        }
    }

    /// Normalizes a `set` on a well-known field into its dedicated variant.
    ///
    /// Backends that cannot write arbitrary fields use this before giving up.
    pub fn normalized(self) -> Result<Self, Self> {
        let (address, path, value) = match self {
            Self::Set { address, path, value } => (address, path, value),
            typed => return Ok(typed),
        };
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        let typed = match segments.as_slice() {
            ["balance"] => parse_quantity(&value).map(|value| Self::Balance { address, value }),
            ["nonce"] => parse_u64(&value).map(|nonce| Self::Nonce { address, nonce }),
            ["code"] => value.as_str().and_then(parse_bytes).map(|code| Self::Code { address, code }),
            ["storage", slot] => parse_slot(slot).and_then(|slot| {
                parse_quantity(&value).map(|value| Self::Storage { address, slot, value })
            }),
            _ => None,
        };
        typed.ok_or(Self::Set { address, path, value })
    }

    /// Applies the mutation to an in-memory state tree.
    pub fn apply_to(&self, state: &mut State) {
        match self {
            Self::Balance { address, value } => state.set_balance(address, *value),
            Self::Nonce { address, nonce } => state.set_nonce(address, *nonce),
            Self::Code { address, code } => state.set_code(address, code),
            Self::Storage { address, slot, value } => state.set_storage(address, *slot, *value),
            Self::Set { address, path, value } => {
                let mut full = vec![crate::ACCOUNTS_KEY.to_string(), crate::format_address(address)];
                full.extend(path.iter().cloned());
                state.account_mut(address);
                state.set_path(&full, value.clone());
            }
        }
    }
}

/// An ordered, atomically applied set of state mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Patch id; generated when the document omits it
    #[serde(default = "PatchId::generate")]
    pub id: PatchId,
    /// Name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Operations, applied in order
    #[serde(default)]
    pub operations: Vec<PatchOperation>,
}

impl Patch {
    /// Empty patch with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PatchId::generate(),
            name: name.into(),
            description: String::new(),
            operations: Vec::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends an operation.
    pub fn with_operation(mut self, operation: PatchOperation) -> Self {
        self.operations.push(operation);
        self
    }
}

/// Outcome of validating a patch. Errors make it invalid; warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// No errors were found
    pub valid: bool,
    /// Problems that prevent application
    pub errors: Vec<String>,
    /// Suspicious but applicable operations
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Builds a report; validity follows from `errors`.
    pub fn new(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors, warnings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use serde_json::json;

    const TARGET: Address = address!("0x00000000000000000000000000000000000000aa");

    #[test]
    fn test_op_type_accepts_unknown_strings() {
        let op: PatchOperation = serde_json::from_value(json!({
            "op_type": "teleport",
            "target_address": "0x00000000000000000000000000000000000000aa",
            "value": 1
        }))
        .unwrap();
        assert_eq!(op.op_type, OpType::Unknown("teleport".into()));
        assert!(op.to_mutation().unwrap_err().contains("teleport"));
    }

    #[test]
    fn test_patch_document_defaults() {
        let patch: Patch = serde_json::from_value(json!({
            "name": "fund",
            "operations": [{"op_type": "balance", "target_address": "0x00000000000000000000000000000000000000aa", "value": "0x1"}]
        }))
        .unwrap();
        assert!(patch.id.as_str().starts_with("patch-"));
        assert_eq!(patch.operations[0].op_type, OpType::Balance);
    }

    #[test]
    fn test_mutations_apply_to_state() {
        let mut state = State::new();
        for op in [
            PatchOperation::balance(&TARGET, U256::from(5u64)),
            PatchOperation::nonce(&TARGET, 3),
            PatchOperation::storage(&TARGET, U256::ZERO, U256::from(7u64)),
            PatchOperation::set(&TARGET, "label", json!("vault")),
        ] {
            op.to_mutation().unwrap().apply_to(&mut state);
        }
        assert_eq!(state.balance(&TARGET), U256::from(5u64));
        assert_eq!(state.nonce(&TARGET), 3);
        assert_eq!(state.storage(&TARGET, U256::ZERO), U256::from(7u64));
        assert_eq!(state.account(&TARGET).unwrap()["label"], json!("vault"));
    }

    #[test]
    fn test_set_normalization() {
        let set = PatchOperation::set(&TARGET, "balance", json!("0x10")).to_mutation().unwrap();
        assert_eq!(
            set.normalized().unwrap(),
            StateMutation::Balance { address: TARGET, value: U256::from(16u64) }
        );
        let custom = PatchOperation::set(&TARGET, "label", json!("x")).to_mutation().unwrap();
        assert!(custom.normalized().is_err());
    }

    #[test]
    fn test_malformed_address_is_rejected() {
        let mut op = PatchOperation::balance(&TARGET, U256::from(1u64));
        op.target_address = "0x1234".into();
        assert!(op.to_mutation().is_err());
    }
}
