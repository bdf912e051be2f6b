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

//! Rewind Adapter - VM adapters for the Rewind time machine
//!
//! Every execution backend is reached through the [`VmAdapter`] capability trait. Three
//! implementations ship with the crate:
//!
//! - [`AnvilAdapter`] spawns and owns a local fork node process
//! - [`RpcNodeAdapter`] talks to an already running node (Anvil, Hardhat or Geth dialect)
//! - [`MockChainAdapter`] is a deterministic in-memory chain for tests and dry runs
//!
//! Adapters are created per job through an [`AdapterFactory`], so two jobs never
//! mutate the same backend instance.

/// The capability trait and the factory abstraction
pub mod adapter;
/// Local fork node process management
pub mod anvil;
/// Decoding of JSON-RPC payloads into Rewind records
pub mod convert;
/// Deterministic in-memory chain
pub mod mock;
/// Adapter for an existing JSON-RPC endpoint
pub mod node;
/// JSON-RPC 2.0 transport
pub mod rpc;
/// Pull-based timeline event stream
pub mod stream;

pub use adapter::*;
pub use anvil::*;
pub use mock::*;
pub use node::*;
pub use rpc::*;
pub use stream::*;
