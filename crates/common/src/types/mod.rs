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

//! Entity types shared by the adapters and the engine.
//!
//! Every record here is plain data: it serializes to the structured form the
//! presentation layer consumes and never holds references to other records.
//! Cross-entity links are ids.

mod branch;
mod chain;
mod diff;
mod ids;
mod job;
mod patch;
mod quantity;
mod session;
mod snapshot;
mod state;

pub use branch::*;
pub use chain::*;
pub use diff::*;
pub use ids::*;
pub use job::*;
pub use patch::*;
pub use quantity::*;
pub use session::*;
pub use snapshot::*;
pub use state::*;
