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

//! The state tree.
//!
//! A [`State`] is a JSON object with a fixed top-level layout:
//!
//! ```text
//! { "block_number": n, "timestamp": t, "gas_used": g, "logs": [...],
//!   "accounts": { "0x<addr>": { "balance": "0x..", "nonce": "0x..", "code": "0x..",
//!                               "storage": { "0x<slot>": "0x<word>" } } } }
//! ```
//!
//! Account keys are lowercase addresses and storage keys are 32-byte words, so two
//! adapters observing the same chain produce byte-identical canonical encodings.

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    format_address, format_quantity, format_word, parse_address, parse_bytes, parse_quantity,
    parse_u64, SnapshotId,
};

/// Key of the account map.
pub const ACCOUNTS_KEY: &str = "accounts";

/// A captured chain state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Value);

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// An empty state with no accounts.
    pub fn new() -> Self {
        let mut root = Map::new();
        root.insert(ACCOUNTS_KEY.to_string(), Value::Object(Map::new()));
        Self(Value::Object(root))
    }

    /// Wraps a JSON value; anything but an object is rejected.
    pub fn from_value(value: Value) -> Result<Self, String> {
        if value.is_object() {
            Ok(Self(value))
        } else {
            Err(format!("state must be a JSON object, got {}", kind_of(&value)))
        }
    }

    /// Decodes canonical (or any JSON) bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }

    /// Borrows the underlying tree.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the state into its tree.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Deterministic encoding: object keys sorted at every level, no whitespace.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail: all keys are strings.
        serde_json::to_vec(&canonicalize(&self.0)).unwrap_or_default()
    }

    /// Content address of this state.
    pub fn content_hash(&self) -> SnapshotId {
        SnapshotId::of_bytes(&self.canonical_bytes())
    }

    fn root_mut(&mut self) -> &mut Map<String, Value> {
        ensure_object(&mut self.0)
    }

    fn header_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(parse_u64)
    }

    /// Block number the state was captured at.
    pub fn block_number(&self) -> Option<u64> {
        self.header_u64("block_number")
    }

    /// Sets the block number.
    pub fn set_block_number(&mut self, number: u64) {
        self.root_mut().insert("block_number".into(), Value::from(number));
    }

    /// Block timestamp.
    pub fn timestamp(&self) -> Option<u64> {
        self.header_u64("timestamp")
    }

    /// Sets the block timestamp.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.root_mut().insert("timestamp".into(), Value::from(timestamp));
    }

    /// Gas used by the captured block.
    pub fn gas_used(&self) -> Option<u64> {
        self.header_u64("gas_used")
    }

    /// Sets the gas used.
    pub fn set_gas_used(&mut self, gas_used: u64) {
        self.root_mut().insert("gas_used".into(), Value::from(gas_used));
    }

    /// Logs emitted in the captured block.
    pub fn logs(&self) -> &[Value] {
        self.0.get("logs").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replaces the logs.
    pub fn set_logs(&mut self, logs: Vec<Value>) {
        self.root_mut().insert("logs".into(), Value::Array(logs));
    }

    /// Addresses present in the account map, in key order.
    pub fn addresses(&self) -> Vec<Address> {
        self.accounts()
            .map(|accounts| accounts.keys().filter_map(|key| parse_address(key)).collect())
            .unwrap_or_default()
    }

    fn accounts(&self) -> Option<&Map<String, Value>> {
        self.0.get(ACCOUNTS_KEY).and_then(Value::as_object)
    }

    /// Raw account object.
    pub fn account(&self, address: &Address) -> Option<&Map<String, Value>> {
        self.accounts()?.get(&format_address(address)).and_then(Value::as_object)
    }

    /// Whether the account exists in the tree.
    pub fn has_account(&self, address: &Address) -> bool {
        self.account(address).is_some()
    }

    /// Mutable account object, created with zero defaults when absent.
    pub fn account_mut(&mut self, address: &Address) -> &mut Map<String, Value> {
        let accounts = ensure_object(
            self.root_mut().entry(ACCOUNTS_KEY).or_insert_with(|| Value::Object(Map::new())),
        );
        let account = accounts.entry(format_address(address)).or_insert_with(empty_account);
        if !account.is_object() {
            *account = empty_account();
        }
        ensure_object(account)
    }

    /// Balance; zero for unknown accounts.
    pub fn balance(&self, address: &Address) -> U256 {
        self.account(address).and_then(|a| a.get("balance")).and_then(parse_quantity).unwrap_or_default()
    }

    /// Overwrites a balance.
    pub fn set_balance(&mut self, address: &Address, balance: U256) {
        self.account_mut(address).insert("balance".into(), Value::String(format_quantity(balance)));
    }

    /// Nonce; zero for unknown accounts.
    pub fn nonce(&self, address: &Address) -> u64 {
        self.account(address).and_then(|a| a.get("nonce")).and_then(parse_u64).unwrap_or_default()
    }

    /// Overwrites a nonce.
    pub fn set_nonce(&mut self, address: &Address, nonce: u64) {
        self.account_mut(address)
            .insert("nonce".into(), Value::String(format_quantity(U256::from(nonce))));
    }

    /// Runtime code; empty for unknown accounts.
    pub fn code(&self, address: &Address) -> Bytes {
        self.account(address)
            .and_then(|a| a.get("code"))
            .and_then(Value::as_str)
            .and_then(parse_bytes)
            .unwrap_or_default()
    }

    /// Overwrites runtime code.
    pub fn set_code(&mut self, address: &Address, code: &Bytes) {
        self.account_mut(address).insert("code".into(), Value::String(code.to_string()));
    }

    /// Storage word; zero when the slot is not in the tree.
    pub fn storage(&self, address: &Address, slot: U256) -> U256 {
        self.account(address)
            .and_then(|a| a.get("storage"))
            .and_then(|s| s.get(format_word(slot)))
            .and_then(parse_quantity)
            .unwrap_or_default()
    }

    /// Storage entries of an account as `(slot, word)` pairs.
    pub fn storage_entries(&self, address: &Address) -> Vec<(U256, U256)> {
        self.account(address)
            .and_then(|a| a.get("storage"))
            .and_then(Value::as_object)
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|(slot, word)| {
                        Some((crate::parse_quantity_str(slot)?, parse_quantity(word)?))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Writes a storage word.
    pub fn set_storage(&mut self, address: &Address, slot: U256, value: U256) {
        let account = self.account_mut(address);
        let storage =
            ensure_object(account.entry("storage").or_insert_with(|| Value::Object(Map::new())));
        storage.insert(format_word(slot), Value::String(format_word(value)));
    }

    /// Looks up a nested value by path segments.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        path.iter().try_fold(&self.0, |node, segment| node.get(segment.as_ref()))
    }

    /// Writes a nested value, creating intermediate objects.
    pub fn set_path<S: AsRef<str>>(&mut self, path: &[S], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            if value.is_object() {
                self.0 = value;
            }
            return;
        };
        let mut node = self.root_mut();
        for segment in parents {
            node = ensure_object(
                node.entry(segment.as_ref()).or_insert_with(|| Value::Object(Map::new())),
            );
        }
        node.insert(last.as_ref().to_string(), value);
    }

    /// Removes a nested value, returning it.
    pub fn remove_path<S: AsRef<str>>(&mut self, path: &[S]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut node = &mut self.0;
        for segment in parents {
            node = node.get_mut(segment.as_ref())?;
        }
        node.as_object_mut()?.remove(last.as_ref())
    }
}

/// Replaces a non-object with an empty object and borrows the map.
fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

fn empty_account() -> Value {
    let mut account = Map::new();
    account.insert("balance".into(), Value::String("0x0".into()));
    account.insert("nonce".into(), Value::String("0x0".into()));
    account.insert("code".into(), Value::String("0x".into()));
    account.insert("storage".into(), Value::Object(Map::new()));
    Value::Object(account)
}

/// Rebuilds `value` with object keys inserted in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Human name of a JSON value kind, for error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use serde_json::json;

    const ALICE: Address = address!("0x00000000000000000000000000000000000000aa");

    #[test]
    fn test_hash_ignores_insertion_order() {
        let a = State::from_value(json!({"accounts": {}, "block_number": 1, "timestamp": 2})).unwrap();
        let b = State::from_value(json!({"timestamp": 2, "block_number": 1, "accounts": {}})).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let mut state = State::new();
        let before = state.content_hash();
        state.set_balance(&ALICE, U256::from(1u64));
        assert_ne!(before, state.content_hash());
    }

    #[test]
    fn test_account_accessors() {
        let mut state = State::new();
        assert_eq!(state.balance(&ALICE), U256::ZERO);
        assert!(!state.has_account(&ALICE));

        state.set_balance(&ALICE, U256::from(42u64));
        state.set_nonce(&ALICE, 7);
        state.set_code(&ALICE, &Bytes::from_static(&[0x60, 0x01]));
        state.set_storage(&ALICE, U256::from(1u64), U256::from(9u64));

        assert_eq!(state.balance(&ALICE), U256::from(42u64));
        assert_eq!(state.nonce(&ALICE), 7);
        assert_eq!(state.code(&ALICE).len(), 2);
        assert_eq!(state.storage(&ALICE, U256::from(1u64)), U256::from(9u64));
        assert_eq!(state.storage_entries(&ALICE), vec![(U256::from(1u64), U256::from(9u64))]);
        assert_eq!(state.addresses(), vec![ALICE]);

        let account = state.get_path(&["accounts", "0x00000000000000000000000000000000000000aa", "balance"]);
        assert_eq!(account, Some(&json!("0x2a")));
    }

    #[test]
    fn test_path_operations() {
        let mut state = State::new();
        state.set_path(&["meta", "label"], json!("x"));
        assert_eq!(state.get_path(&["meta", "label"]), Some(&json!("x")));
        assert_eq!(state.remove_path(&["meta", "label"]), Some(json!("x")));
        assert_eq!(state.get_path(&["meta", "label"]), None);
        assert_eq!(state.remove_path(&["missing", "x"]), None);
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(State::from_value(json!([1, 2])).is_err());
        let state = State::from_slice(br#"{"accounts":{}}"#).unwrap();
        assert_eq!(state, State::new());
    }

    #[test]
    fn test_header_fields() {
        let mut state = State::new();
        state.set_block_number(100);
        state.set_timestamp(1_700_000_000);
        state.set_gas_used(21_000);
        state.set_logs(vec![json!({"address": "0x01"})]);
        assert_eq!(state.block_number(), Some(100));
        assert_eq!(state.timestamp(), Some(1_700_000_000));
        assert_eq!(state.gas_used(), Some(21_000));
        assert_eq!(state.logs().len(), 1);
    }
}
