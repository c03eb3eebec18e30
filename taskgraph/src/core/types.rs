//! Shared deterministic types for the planner, executor and scheduler.
//!
//! These types define stable contracts between components and the on-disk
//! snapshots. They must not depend on external state or I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical name of the output every subtask must declare.
pub const MAIN_RESULT: &str = "main_result";

/// One unit of work produced by decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instruction: String,
    /// Ids of subtasks that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Logical input name to `"<task_id>:<output_name>"` or a literal path.
    #[serde(default)]
    pub input_files: BTreeMap<String, String>,
    /// Logical output name to path. Always contains [`MAIN_RESULT`].
    pub output_files: BTreeMap<String, String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Per-subtask override of the engine timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Subtask {
    pub fn main_result_path(&self) -> Option<&str> {
        self.output_files.get(MAIN_RESULT).map(String::as_str)
    }
}

/// Summary and details of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBody {
    pub summary: String,
    #[serde(default)]
    pub details: String,
}

/// Normalized outcome of executing one subtask.
///
/// Invariant: `success == false` implies `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub result: ResultBody,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Build a failed result, keeping the error and summary consistent.
    pub fn failure(task_id: &str, error: impl Into<String>, details: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            task_id: task_id.to_string(),
            success: false,
            result: ResultBody {
                summary: format!("Execution failed: {error}"),
                details: details.into(),
            },
            artifacts: BTreeMap::new(),
            next_steps: None,
            error: Some(error),
        }
    }

    /// Mark the result failed, appending to any existing error.
    pub fn fail_with(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.success = false;
        self.error = Some(match self.error.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}; {error}"),
            _ => error,
        });
    }
}

/// Self-reported engine status for the current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Completed,
    Continue,
    NeedsVerification,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" => Some(Self::Completed),
            "CONTINUE" => Some(Self::Continue),
            "NEEDS_VERIFICATION" => Some(Self::NeedsVerification),
            _ => None,
        }
    }
}

/// Per-subtask line in the aggregated final result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskOutcome {
    pub success: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Aggregate result of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResult {
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    pub subtask_counts: SubtaskCounts,
    #[serde(default)]
    pub subtask_results: BTreeMap<String, SubtaskOutcome>,
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerPhase {
    #[default]
    Analyzing,
    Decomposed,
    Executing,
    Evaluating,
    Adjusting,
    Finalizing,
    Done,
}
