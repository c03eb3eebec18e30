//! Deterministic, pure logic shared by the planner, executor and scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod extract;
pub mod graph;
pub mod invariants;
pub mod normalize;
pub mod plan;
pub mod retry;
pub mod types;
