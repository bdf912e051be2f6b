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

//! Guards on patch operations.
//!
//! A condition is a short expression evaluated against the account the operation
//! targets, in the source state:
//!
//! | Expression | Holds when |
//! |---|---|
//! | `balance_gt:<v>` / `balance_lt:<v>` / `balance_eq:<v>` | balance compared with `v` |
//! | `nonce_eq:<n>` | nonce equals `n` |
//! | `code_empty` / `code_present` | account has no code / has code |
//! | `storage_eq:<slot>:<v>` | storage word at `slot` equals `v` |
//!
//! Values accept `0x` hex or decimal.

use std::{fmt, str::FromStr};

use alloy_primitives::{Address, U256};
use rewind_common::{format_quantity, parse_quantity_str, parse_slot, State};

/// Parsed operation guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Balance strictly greater than
    BalanceGt(U256),
    /// Balance strictly lower than
    BalanceLt(U256),
    /// Balance equal to
    BalanceEq(U256),
    /// Nonce equal to
    NonceEq(u64),
    /// No code deployed
    CodeEmpty,
    /// Code deployed
    CodePresent,
    /// Storage word equal to
    StorageEq {
        /// Slot
        slot: U256,
        /// Expected word
        value: U256,
    },
}

impl Condition {
    /// Evaluates the guard for `address` in `state`.
    pub fn holds(&self, state: &State, address: &Address) -> bool {
        match self {
            Self::BalanceGt(v) => state.balance(address) > *v,
            Self::BalanceLt(v) => state.balance(address) < *v,
            Self::BalanceEq(v) => state.balance(address) == *v,
            Self::NonceEq(n) => state.nonce(address) == *n,
            Self::CodeEmpty => state.code(address).is_empty(),
            Self::CodePresent => !state.code(address).is_empty(),
            Self::StorageEq { slot, value } => state.storage(address, *slot) == *value,
        }
    }
}

fn quantity(text: &str, expr: &str) -> Result<U256, String> {
    parse_quantity_str(text).ok_or_else(|| format!("condition '{expr}': '{text}' is not a number"))
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let mut parts = expr.trim().split(':');
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        let condition = match (name, args.as_slice()) {
            ("balance_gt", [v]) => Self::BalanceGt(quantity(v, expr)?),
            ("balance_lt", [v]) => Self::BalanceLt(quantity(v, expr)?),
            ("balance_eq", [v]) => Self::BalanceEq(quantity(v, expr)?),
            ("nonce_eq", [n]) => Self::NonceEq(
                u64::try_from(quantity(n, expr)?)
                    .map_err(|_| format!("condition '{expr}': nonce does not fit in 64 bits"))?,
            ),
            ("code_empty", []) => Self::CodeEmpty,
            ("code_present", []) => Self::CodePresent,
            ("storage_eq", [slot, v]) => Self::StorageEq {
                slot: parse_slot(slot)
                    .ok_or_else(|| format!("condition '{expr}': malformed slot '{slot}'"))?,
                value: quantity(v, expr)?,
            },
            _ => return Err(format!("unknown condition '{expr}'")),
        };
        Ok(condition)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BalanceGt(v) => write!(f, "balance_gt:{v}"),
            Self::BalanceLt(v) => write!(f, "balance_lt:{v}"),
            Self::BalanceEq(v) => write!(f, "balance_eq:{v}"),
            Self::NonceEq(n) => write!(f, "nonce_eq:{n}"),
            Self::CodeEmpty => f.write_str("code_empty"),
            Self::CodePresent => f.write_str("code_present"),
            Self::StorageEq { slot, value } => {
                write!(f, "storage_eq:{}:{value}", format_quantity(*slot))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::test_utils::{sample_state, ALICE, BOB, VAULT};

    #[test]
    fn test_parse_and_evaluate() {
        let state = sample_state(100);
        let holds = |expr: &str, who: &Address| expr.parse::<Condition>().unwrap().holds(&state, who);

        assert!(holds("balance_gt:999", &ALICE));
        assert!(!holds("balance_gt:0x3e8", &ALICE));
        assert!(holds("balance_lt:1", &BOB));
        assert!(holds("balance_eq:0", &BOB));
        assert!(holds("nonce_eq:0", &ALICE));
        assert!(holds("code_empty", &ALICE));
        assert!(holds("code_present", &VAULT));
        assert!(holds("storage_eq:0x0:1", &VAULT));
        assert!(!holds("storage_eq:0x1:1", &VAULT));
    }

    #[test]
    fn test_malformed_conditions() {
        for expr in ["balance_gt", "balance_gt:abc", "storage_eq:1:2", "code_empty:now", "whenever"] {
            assert!(expr.parse::<Condition>().is_err(), "{expr} should not parse");
        }
    }

    #[test]
    fn test_display_round_trips() {
        let condition: Condition = "storage_eq:0x2:0x10".parse().unwrap();
        assert_eq!(condition.to_string().parse::<Condition>().unwrap(), condition);
    }
}
