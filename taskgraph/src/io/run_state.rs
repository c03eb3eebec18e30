//! Run bookkeeping snapshots: `run_state.json`, `progress.json`, `execution_summary.json`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{PlannerPhase, SubtaskCounts};
use crate::io::write_json_atomic;

pub const RUN_STATE_FILE: &str = "run_state.json";
pub const PROGRESS_FILE: &str = "progress.json";
pub const SUMMARY_FILE: &str = "execution_summary.json";

/// Persisted bookkeeping for one run (`<run_root>/run_state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    pub task_description: String,
    pub phase: PlannerPhase,
    /// Batches fully executed so far.
    pub completed_batches: usize,
    /// Plan revision at the last snapshot.
    pub plan_revision: u64,
    pub started_at: String,
    pub updated_at: String,
}

/// Per-task progress snapshot (`<run_root>/progress.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub total_tasks: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
    pub updated_at: String,
}

/// Run-level summary (`<run_root>/execution_summary.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub task_description: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: f64,
    pub subtask_counts: SubtaskCounts,
    pub batches: Vec<Vec<String>>,
    pub critical_path: Vec<String>,
    pub success: bool,
    pub summary: String,
}

pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, phase = ?state.phase, batches = state.completed_batches, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, phase = ?state.phase, "writing run state");
    write_json_atomic(path, state)
}

pub fn write_progress(path: &Path, progress: &Progress) -> Result<()> {
    write_json_atomic(path, progress)
}

pub fn write_run_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    write_json_atomic(path, summary)
}
