//! Injected tracing agent.
//!
//! The DBI host loads this library into the traced process and drives it
//! through three callbacks: module load/unload, basic-block discovery, and
//! the clean call executed at every instrumented block head. All agent
//! state lives in one [`context::AgentContext`] published through a
//! process-wide handle; the host-facing FFI (behind the `dynamorio`
//! feature) is a thin translation layer over the library code here.

pub mod commands;
pub mod context;
pub mod dbi;
pub mod instrument;
pub mod modules;

pub use context::AgentContext;
pub use instrument::{on_block_executed, plan_block, BlockBounds};
