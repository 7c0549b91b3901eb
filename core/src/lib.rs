//! Root of the `warden-core` library: the turn-processing kernel behind
//! the `controller_turn` tool.

// Prevent accidental direct writes to stdout/stderr in library code; stdout
// belongs to the JSON-RPC transport and diagnostics go through `tracing`.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod apply_patch;
pub mod adapters;
pub mod artifacts;
mod budget;
pub mod capability;
pub mod collision;
pub mod config;
pub mod context_pack;
pub mod enforcement;
pub mod error;
pub mod events;
pub mod memory;
pub mod plan_validator;
mod reads;
mod recipes;
pub mod retrieval;
mod sandbox;
pub mod session;
mod side_effect;
pub mod turn;
pub mod util;

pub use config::Config;
pub use config::ConfigOverrides;
pub use turn::Controller;
