//! Task decomposition and dependency-ordered execution against a reasoning engine.
//!
//! A task description is analyzed and broken down into subtasks, the subtasks
//! run in dependency batches against an external engine, intermediate results
//! and files flow from producers to dependents, and everything is integrated
//! into a final result. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (normalization, plan arena,
//!   batching, result extraction, retry state machine). No I/O.
//! - **[`io`]**: Side-effecting pieces (config, engine process, context store,
//!   prompts, snapshots). Isolated so tests can script the engine.
//! - **[`agents`]**: The planner and the subtask executor.
//!
//! [`scheduler`] and [`run`] coordinate agents with I/O to implement CLI commands.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
