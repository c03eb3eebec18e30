//! Orchestration for whole runs.
//!
//! A run lives in `<logs_dir>/<run_id>/` and is identified by a stable
//! `run_id`. Every entry point ends the same way: final integration, then
//! `final_result.json` and `execution_summary.json`. Snapshots written after
//! each unit of work let [`TaskRunner::resume`] pick up an interrupted run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::agents::executor::SubtaskExecutor;
use crate::agents::planner::{Planner, PlanningError};
use crate::core::graph::{ScheduleDiagnostic, critical_path, schedule};
use crate::core::normalize::normalize_subtasks;
use crate::core::types::{FinalResult, PlannerPhase, Subtask};
use crate::io::config::{RunConfig, write_config};
use crate::io::context::ContextStore;
use crate::io::engine::ReasoningEngine;
use crate::io::now_rfc3339;
use crate::io::plan_store::{PLAN_FILE, load_plan};
use crate::io::run_state::{
    RUN_STATE_FILE, RunState, RunSummary, SUMMARY_FILE, load_run_state, write_run_state,
    write_run_summary,
};
use crate::scheduler::{BatchReport, DependencyScheduler, persist_run};

const CONFIG_FILE: &str = "config.toml";

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_root: PathBuf,
    pub final_result: FinalResult,
    pub summary: RunSummary,
}

/// Batching preview of a subtask list (no engine involved).
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub subtasks: Vec<Subtask>,
    pub batches: Vec<Vec<String>>,
    pub diagnostics: Vec<ScheduleDiagnostic>,
    pub critical_path: Vec<String>,
}

/// Per-run working set threaded through the stages of a run.
struct Session<'e, E> {
    run_root: PathBuf,
    state: RunState,
    store: ContextStore,
    planner: Planner<&'e E>,
    started: Instant,
}

/// Entry point for executing and resuming runs against one engine.
pub struct TaskRunner<E> {
    engine: E,
    logs_dir: PathBuf,
    config: RunConfig,
}

impl<E: ReasoningEngine> TaskRunner<E> {
    pub fn new(engine: E, logs_dir: impl Into<PathBuf>, config: RunConfig) -> Self {
        Self {
            engine,
            logs_dir: logs_dir.into(),
            config,
        }
    }

    /// Analyze, decompose, execute in dependency batches and integrate.
    #[instrument(skip_all)]
    pub fn execute_task(&self, task_description: &str) -> Result<RunOutcome> {
        let mut session = self.start(task_description)?;
        let analysis = session.planner.analyze_task(&mut session.store);
        session
            .planner
            .break_down_task(&mut session.store, &analysis)?;
        persist_run(&session.run_root, &session.planner, &session.store, &mut session.state)?;
        self.run_batches(session)
    }

    /// Like [`TaskRunner::execute_task`] but one subtask at a time in plan order.
    #[instrument(skip_all)]
    pub fn execute_sequential(&self, task_description: &str) -> Result<RunOutcome> {
        let mut session = self.start(task_description)?;
        let analysis = session.planner.analyze_task(&mut session.store);
        session
            .planner
            .break_down_task(&mut session.store, &analysis)?;
        persist_run(&session.run_root, &session.planner, &session.store, &mut session.state)?;

        let executor = SubtaskExecutor::new(&self.engine, &session.run_root, &self.config);
        let mut batches = Vec::new();
        while let Some(subtask) = session.planner.get_next_subtask(&mut session.store)? {
            let mut context = session.store.checkout(&subtask.id)?;
            let result = executor.execute_subtask(&subtask, &mut context);
            session.store.check_in(context);
            session.planner.process_result(&mut session.store, result)?;
            session.state.completed_batches += 1;
            batches.push(vec![subtask.id.clone()]);
            persist_run(&session.run_root, &session.planner, &session.store, &mut session.state)?;
        }
        self.finish(session, batches)
    }

    /// Execute caller-supplied subtasks, skipping analysis and decomposition.
    #[instrument(skip_all, fields(subtasks = raw_subtasks.len()))]
    pub fn execute_predefined(&self, task_description: &str, raw_subtasks: &[Value]) -> Result<RunOutcome> {
        let subtasks = normalize_subtasks(raw_subtasks);
        if subtasks.is_empty() {
            return Err(anyhow!("no subtasks supplied"));
        }
        let mut session = self.start(task_description)?;
        session.planner.install_plan(&mut session.store, subtasks)?;
        persist_run(&session.run_root, &session.planner, &session.store, &mut session.state)?;
        self.run_batches(session)
    }

    /// Continue an interrupted run from its snapshots.
    #[instrument(skip_all, fields(run_id = run_id))]
    pub fn resume(&self, run_id: &str) -> Result<RunOutcome> {
        let run_root = self.logs_dir.join(run_id);
        let unresumable = |err: anyhow::Error| PlanningError::Resume {
            run_id: run_id.to_string(),
            reason: format!("{err:#}"),
        };
        let state = load_run_state(&run_root.join(RUN_STATE_FILE)).map_err(unresumable)?;
        let plan = load_plan(&run_root.join(PLAN_FILE)).map_err(unresumable)?;
        let store = ContextStore::load_all(&run_root).map_err(unresumable)?;
        info!(
            phase = ?state.phase,
            batches = state.completed_batches,
            revision = plan.revision(),
            "resuming run"
        );

        let planner = Planner::restore(
            &state.task_description,
            &self.engine,
            &run_root,
            &self.config,
            plan,
            &store,
        );
        self.run_batches(Session {
            run_root,
            state,
            store,
            planner,
            started: Instant::now(),
        })
    }

    fn start(&self, task_description: &str) -> Result<Session<'_, E>> {
        if task_description.trim().is_empty() {
            return Err(PlanningError::EmptyTask.into());
        }
        let run_id = generate_run_id();
        let run_root = self.logs_dir.join(&run_id);
        fs::create_dir_all(&run_root)
            .with_context(|| format!("create run dir {}", run_root.display()))?;
        write_config(&run_root.join(CONFIG_FILE), &self.config)?;

        let now = now_rfc3339();
        let state = RunState {
            run_id: run_id.clone(),
            task_description: task_description.to_string(),
            started_at: now.clone(),
            updated_at: now,
            ..RunState::default()
        };
        write_run_state(&run_root.join(RUN_STATE_FILE), &state)?;
        info!(run_id = %run_id, root = %run_root.display(), "run started");

        Ok(Session {
            store: ContextStore::new(&run_root),
            planner: Planner::new(task_description, &self.engine, &run_root, &self.config),
            run_root,
            state,
            started: Instant::now(),
        })
    }

    fn run_batches(&self, mut session: Session<'_, E>) -> Result<RunOutcome> {
        let executor = SubtaskExecutor::new(&self.engine, &session.run_root, &self.config);
        let scheduler = DependencyScheduler::new(&session.run_root, &self.config.scheduler);
        session.planner.set_phase(PlannerPhase::Executing);
        let reports = scheduler.run(
            &mut session.planner,
            &executor,
            &mut session.store,
            &mut session.state,
        )?;
        let batches = reports.into_iter().map(|r: BatchReport| r.task_ids).collect();
        self.finish(session, batches)
    }

    fn finish(&self, mut session: Session<'_, E>, batches: Vec<Vec<String>>) -> Result<RunOutcome> {
        let final_result = session.planner.get_final_result(&mut session.store)?;
        persist_run(&session.run_root, &session.planner, &session.store, &mut session.state)?;

        let summary = RunSummary {
            run_id: session.state.run_id.clone(),
            task_description: session.state.task_description.clone(),
            started_at: session.state.started_at.clone(),
            finished_at: now_rfc3339(),
            duration_secs: session.started.elapsed().as_secs_f64(),
            subtask_counts: final_result.subtask_counts,
            batches,
            critical_path: critical_path(&session.planner.plan().subtasks()),
            success: final_result.success,
            summary: final_result.summary.clone(),
        };
        write_run_summary(&session.run_root.join(SUMMARY_FILE), &summary)?;
        info!(
            run_id = %summary.run_id,
            success = summary.success,
            succeeded = summary.subtask_counts.succeeded,
            failed = summary.subtask_counts.failed,
            "run finished"
        );

        Ok(RunOutcome {
            run_id: session.state.run_id,
            run_root: session.run_root,
            final_result,
            summary,
        })
    }
}

/// `run_<YYYYmmdd_HHMMSS>_<6 alphanumerics>`.
pub fn generate_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("run_{}_{suffix}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

/// Read subtask definitions: a JSON array or an object with a `subtasks` array.
pub fn load_subtasks_file(path: &Path) -> Result<Vec<Value>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read subtasks {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse subtasks {}", path.display()))?;
    let list = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(_) => value
            .get("subtasks")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| anyhow!("{} has no `subtasks` array", path.display()))?,
        _ => return Err(anyhow!("{} must hold a JSON array or object", path.display())),
    };
    debug!(count = list.len(), path = %path.display(), "subtasks loaded");
    Ok(list)
}

/// Normalize and batch subtasks without running anything.
pub fn preview_plan(raw_subtasks: &[Value]) -> PlanPreview {
    let subtasks = normalize_subtasks(raw_subtasks);
    let schedule = schedule(&subtasks);
    PlanPreview {
        critical_path: critical_path(&subtasks),
        batches: schedule.batches,
        diagnostics: schedule.diagnostics,
        subtasks,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn run_ids_have_timestamp_and_suffix() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4, "{id}");
        assert_eq!(parts[0], "run");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 6);
        assert!(parts[3].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn subtasks_file_accepts_array_or_object() {
        let temp = tempfile::tempdir().expect("tempdir");
        let array = temp.path().join("array.json");
        let object = temp.path().join("object.json");
        fs::write(&array, r#"[{"id": "a"}]"#).expect("write");
        fs::write(&object, r#"{"subtasks": [{"id": "a"}, {"id": "b"}]}"#).expect("write");

        assert_eq!(load_subtasks_file(&array).expect("array").len(), 1);
        assert_eq!(load_subtasks_file(&object).expect("object").len(), 2);
    }

    #[test]
    fn subtasks_file_rejects_scalars() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.json");
        fs::write(&path, "42").expect("write");
        assert!(load_subtasks_file(&path).is_err());
    }

    #[test]
    fn preview_reports_batches_and_cycles() {
        let preview = preview_plan(&[
            json!({"id": "a", "instruction": "x"}),
            json!({"id": "b", "instruction": "y", "dependencies": ["a", "ghost"]}),
            json!({"id": "c", "instruction": "z", "dependencies": ["d"]}),
            json!({"id": "d", "instruction": "w", "dependencies": ["c"]}),
        ]);

        assert_eq!(preview.batches[0], vec!["a"]);
        assert_eq!(preview.batches[1], vec!["b"]);
        assert_eq!(preview.batches.last().expect("cycle batch"), &vec!["c", "d"]);
        assert!(preview.diagnostics.iter().any(|d| matches!(
            d,
            ScheduleDiagnostic::UnknownDependency { dependency, .. } if dependency == "ghost"
        )));
        assert!(preview.diagnostics.iter().any(|d| matches!(d, ScheduleDiagnostic::Cycle { .. })));
        assert_eq!(preview.critical_path, vec!["a", "b"]);
    }
}
