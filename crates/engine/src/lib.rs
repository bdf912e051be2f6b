pub mod branch;
pub use branch::*;

pub mod config;
pub use config::*;

pub mod controller;
pub use controller::*;

pub mod core;
pub use core::*;

pub mod diff;
pub use diff::*;

pub mod patch;
pub use patch::*;

pub mod session;
pub use session::*;

pub mod store;
pub use store::*;
