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

//! Hex and decimal quantity helpers.
//!
//! Backends disagree on number encoding: JSON-RPC uses `0x` quantities, patch documents
//! written by hand often carry decimals, and older tooling emits plain JSON numbers.
//! Everything funnels through [`parse_quantity`].

use alloy_primitives::{Address, B256, U256};
use serde_json::Value;

/// Formats a quantity as minimal `0x` hex; zero is `0x0`.
pub fn format_quantity(value: U256) -> String {
    if value.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{value:x}")
    }
}

/// Formats a 32-byte storage word as `0x` followed by 64 hex digits.
pub fn format_word(value: U256) -> String {
    format!("0x{}", hex::encode(B256::from(value)))
}

/// Lowercase `0x` address; used as the account key in a state tree.
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}

/// Parses `0x` hex or decimal text into a quantity.
pub fn parse_quantity_str(text: &str) -> Option<U256> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if hex.is_empty() {
            return Some(U256::ZERO);
        }
        U256::from_str_radix(hex, 16).ok()
    } else if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        U256::from_str_radix(text, 10).ok()
    } else {
        None
    }
}

/// Parses a JSON string or non-negative integer into a quantity.
pub fn parse_quantity(value: &Value) -> Option<U256> {
    match value {
        Value::String(text) => parse_quantity_str(text),
        Value::Number(number) => parse_quantity_str(&number.to_string()),
        _ => None,
    }
}

/// Parses a quantity that must fit in a `u64`.
pub fn parse_u64(value: &Value) -> Option<u64> {
    parse_quantity(value).and_then(|q| u64::try_from(q).ok())
}

/// Signed difference `new - old` rendered as `+n`, `-n` or `0`.
pub fn signed_delta(old: U256, new: U256) -> String {
    if new > old {
        format!("+{}", new - old)
    } else if new < old {
        format!("-{}", old - new)
    } else {
        "0".to_string()
    }
}

/// Whether `text` is `0x` followed by exactly 40 hex digits.
pub fn is_address_like(text: &str) -> bool {
    text.len() == 42
        && (text.starts_with("0x") || text.starts_with("0X"))
        && text[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses a strictly formatted address.
pub fn parse_address(text: &str) -> Option<Address> {
    if !is_address_like(text) {
        return None;
    }
    hex::decode(&text[2..]).ok().map(|bytes| Address::from_slice(&bytes))
}

/// Parses a storage slot given either as a 32-byte word or as a quantity.
pub fn parse_slot(text: &str) -> Option<U256> {
    let hex = text.trim().strip_prefix("0x")?;
    if hex.len() > 64 {
        return None;
    }
    parse_quantity_str(text)
}

/// Parses `0x` hex bytes; odd-length input is rejected.
pub fn parse_bytes(text: &str) -> Option<alloy_primitives::Bytes> {
    let hex = text.trim().strip_prefix("0x")?;
    hex::decode(hex).ok().map(Into::into)
}
