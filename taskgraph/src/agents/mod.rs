//! Agents that talk to the reasoning engine: the planner and the subtask executor.

pub mod executor;
pub mod planner;
