//! Planner agent: analysis, decomposition, result ingestion and re-planning.
//!
//! The planner owns the plan arena and every recorded result. Contexts live in
//! the [`ContextStore`], which callers pass in so the scheduler can hand the
//! same store to workers between planner calls.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::find_json;
use crate::core::invariants::validate_plan;
use crate::core::normalize::{fallback_subtask, normalize_subtasks};
use crate::core::plan::{AdjustmentReport, EntryState, Plan, parse_adjustment};
use crate::core::types::{
    ExecutionResult, FinalResult, PlannerPhase, Subtask, SubtaskCounts, SubtaskOutcome,
};
use crate::io::artifacts::{list_files, resolve_path};
use crate::io::config::RunConfig;
use crate::io::context::{ContextStore, FileMetadata, keys};
use crate::io::engine::{EngineRequest, ReasoningEngine};
use crate::io::prompt::{AdjustmentPromptInputs, PromptBuilder, ProgressView, ResultLine};
use crate::io::{now_rfc3339, write_json_atomic};

/// Id of the planner's own context.
pub const PLANNER_CONTEXT: &str = "planner";

pub const FINAL_RESULT_FILE: &str = "final_result.json";

/// Failures that stop a run before or instead of execution.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("task description is empty")]
    EmptyTask,
    #[error("plan violates invariants: {0}")]
    InvalidPlan(String),
    #[error("cannot resume run {run_id}: {reason}")]
    Resume { run_id: String, reason: String },
}

/// What happened when the planner reviewed a failed subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjustmentOutcome {
    Applied(AdjustmentReport),
    NotNeeded,
    /// The engine answered but not with a recognizable decision; plan unchanged.
    Unparsed,
    /// The engine call failed; plan unchanged.
    EngineFailed(String),
}

#[derive(Debug, Serialize)]
struct AdjustmentRecord<'a> {
    task_id: &'a str,
    reason: &'a str,
    decision: &'a Value,
    report: &'a AdjustmentReport,
    revision: u64,
    timestamp: String,
}

pub struct Planner<E> {
    task_description: String,
    engine: E,
    run_root: PathBuf,
    prompts: PromptBuilder,
    timeout: Duration,
    plan: Plan,
    results: BTreeMap<String, ExecutionResult>,
    phase: PlannerPhase,
}

impl<E: ReasoningEngine> Planner<E> {
    pub fn new(
        task_description: &str,
        engine: E,
        run_root: impl Into<PathBuf>,
        config: &RunConfig,
    ) -> Self {
        Self {
            task_description: task_description.to_string(),
            engine,
            run_root: run_root.into(),
            prompts: PromptBuilder::new(config.prompt.budget_bytes),
            timeout: config.engine_timeout(),
            plan: Plan::default(),
            results: BTreeMap::new(),
            phase: PlannerPhase::Analyzing,
        }
    }

    /// Rebuild a planner from a persisted plan and the results recorded in `store`.
    pub fn restore(
        task_description: &str,
        engine: E,
        run_root: impl Into<PathBuf>,
        config: &RunConfig,
        mut plan: Plan,
        store: &ContextStore,
    ) -> Self {
        let requeued = plan.requeue_in_flight();
        if !requeued.is_empty() {
            info!(tasks = ?requeued, "requeued interrupted subtasks");
        }
        let mut results = BTreeMap::new();
        for entry in plan.entries() {
            if entry.state != EntryState::Completed {
                continue;
            }
            let id = &entry.subtask.id;
            let recorded = store
                .get(id)
                .and_then(|ctx| ctx.local(keys::RESULT))
                .and_then(|value| serde_json::from_value::<ExecutionResult>(value.clone()).ok());
            match recorded {
                Some(result) => {
                    results.insert(id.clone(), result);
                }
                None => warn!(task = %id, "completed subtask has no recorded result"),
            }
        }
        let mut planner = Self::new(task_description, engine, run_root, config);
        planner.plan = plan;
        planner.results = results;
        planner.phase = PlannerPhase::Executing;
        planner
    }

    pub fn task_description(&self) -> &str {
        &self.task_description
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    pub fn results(&self) -> &BTreeMap<String, ExecutionResult> {
        &self.results
    }

    pub fn phase(&self) -> PlannerPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: PlannerPhase) {
        debug!(from = ?self.phase, to = ?phase, "planner phase");
        self.phase = phase;
    }

    /// Ask the engine for a task analysis and store it in the planner context.
    #[instrument(skip_all)]
    pub fn analyze_task(&mut self, store: &mut ContextStore) -> Value {
        self.set_phase(PlannerPhase::Analyzing);
        let analysis = match self
            .prompts
            .build_analysis(&self.task_description)
            .map_err(|err| format!("{err:#}"))
            .and_then(|prompt| self.ask(&prompt))
        {
            Ok(output) => {
                let parsed = find_json(&output);
                let field = |key: &str| {
                    parsed
                        .as_ref()
                        .and_then(|v| v.get(key))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                json!({
                    "success": true,
                    "summary": field("summary").unwrap_or_else(|| first_chars(&output, 200)),
                    "details": field("details").unwrap_or_else(|| output.clone()),
                    "raw": parsed.unwrap_or(Value::String(output)),
                })
            }
            Err(err) => {
                warn!(error = %err, "task analysis failed; continuing without it");
                json!({
                    "success": false,
                    "summary": format!("Analysis unavailable: {err}"),
                    "details": "",
                    "raw": Value::Null,
                })
            }
        };

        let planner = store.ensure_context(PLANNER_CONTEXT);
        planner.update_local(keys::TASK_DESCRIPTION, json!(self.task_description));
        planner.update_local(keys::ANALYSIS, analysis.clone());
        planner.add_execution_record(
            "task_analyzed",
            analysis["summary"].as_str().unwrap_or_default(),
            Map::new(),
        );
        analysis
    }

    /// Ask the engine for a subtask list and install it as the plan.
    ///
    /// Engine or parse failures fall back to a single subtask covering the
    /// whole task.
    #[instrument(skip_all)]
    pub fn break_down_task(&mut self, store: &mut ContextStore, analysis: &Value) -> Result<Vec<Subtask>> {
        let analysis_text = analysis
            .get("details")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .or_else(|| analysis.get("summary").and_then(Value::as_str))
            .unwrap_or_default();

        let subtasks = match self
            .prompts
            .build_breakdown(&self.task_description, analysis_text)
            .map_err(|err| format!("{err:#}"))
            .and_then(|prompt| self.ask(&prompt))
        {
            Ok(output) => {
                let raw = find_json(&output).and_then(|value| subtask_list(&value));
                match raw {
                    Some(raw) if !raw.is_empty() => normalize_subtasks(&raw),
                    _ => {
                        warn!("decomposition returned no usable subtasks; using fallback");
                        vec![fallback_subtask(&self.task_description)]
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "decomposition failed; using fallback");
                vec![fallback_subtask(&self.task_description)]
            }
        };

        self.install_plan(store, subtasks.clone())?;
        Ok(subtasks)
    }

    /// Install normalized subtasks as the plan and create their contexts.
    pub fn install_plan(&mut self, store: &mut ContextStore, subtasks: Vec<Subtask>) -> Result<()> {
        let errors = validate_plan(&subtasks);
        if !errors.is_empty() {
            return Err(PlanningError::InvalidPlan(errors.join("; ")).into());
        }

        let analysis_summary = store
            .get(PLANNER_CONTEXT)
            .and_then(|ctx| ctx.local(keys::ANALYSIS))
            .and_then(|a| a.get("summary"))
            .cloned()
            .unwrap_or(Value::Null);
        {
            let planner = store.ensure_context(PLANNER_CONTEXT);
            planner.update_local(keys::TASK_DESCRIPTION, json!(self.task_description));
            planner.update_local(
                keys::SUBTASKS,
                serde_json::to_value(&subtasks).context("serialize subtasks")?,
            );
            planner.add_execution_record(
                "task_decomposed",
                &format!("{} subtasks", subtasks.len()),
                Map::new(),
            );
        }
        for subtask in &subtasks {
            self.create_context(store, subtask, &analysis_summary)?;
        }
        store.create_output_directories(&subtasks)?;

        info!(subtasks = subtasks.len(), "plan installed");
        self.plan = Plan::new(subtasks);
        self.set_phase(PlannerPhase::Decomposed);
        Ok(())
    }

    fn create_context(
        &self,
        store: &mut ContextStore,
        subtask: &Subtask,
        analysis_summary: &Value,
    ) -> Result<()> {
        let context =
            store.create_subtask_context(PLANNER_CONTEXT, &subtask.id, Some(&[keys::TASK_DESCRIPTION]));
        context.update_local(
            keys::TASK_DEFINITION,
            serde_json::to_value(subtask).context("serialize subtask")?,
        );
        context.update_local(keys::ANALYSIS_SUMMARY, analysis_summary.clone());
        for (name, path) in &subtask.output_files {
            context.add_file_reference(
                &format!("output_{name}"),
                resolve_path(&self.run_root, path),
                FileMetadata::output(&subtask.id, name),
            );
        }
        Ok(())
    }

    /// Bring a modified subtask's context in line with its new definition.
    ///
    /// Output references the subtask declared for itself are replaced; inputs,
    /// propagated files and artifacts are kept.
    fn refresh_context(
        &self,
        store: &mut ContextStore,
        subtask: &Subtask,
        reason: &str,
    ) -> Result<()> {
        if store.get(&subtask.id).is_none() {
            self.create_context(store, subtask, &Value::Null)?;
        }
        let definition = serde_json::to_value(subtask).context("serialize subtask")?;
        let Some(context) = store.get_mut(&subtask.id) else {
            return Ok(());
        };
        context.update_local(keys::TASK_DEFINITION, definition);
        context.update_local(keys::MODIFIED_FROM_ADJUSTMENT, json!(true));
        context.update_local(keys::MODIFICATION_REASON, json!(reason));
        context.file_paths.retain(|_, reference| {
            !(reference.metadata.is_output()
                && reference.metadata.created_by.as_deref() == Some(subtask.id.as_str()))
        });
        for (name, path) in &subtask.output_files {
            context.add_file_reference(
                &format!("output_{name}"),
                resolve_path(&self.run_root, path),
                FileMetadata::output(&subtask.id, name),
            );
        }
        store.create_output_directories(std::slice::from_ref(subtask))
    }

    /// Resolve a subtask's inputs and progress into its context before execution.
    pub fn prepare_subtask(&self, store: &mut ContextStore, task_id: &str) -> Result<()> {
        let Some(subtask) = self.plan.get(task_id).cloned() else {
            warn!(task = task_id, "prepare for unknown subtask");
            return Ok(());
        };
        if store.get(task_id).is_none() {
            self.create_context(store, &subtask, &Value::Null)?;
        }

        let mut resolved = Vec::new();
        for (key, spec) in &subtask.input_files {
            resolved.push((key.clone(), self.resolve_input(store, spec)));
        }

        let position = self.plan.position(task_id).unwrap_or_default();
        let progress = ProgressView {
            current_index: position + 1,
            total_tasks: self.plan.len(),
            completed_tasks: self
                .plan
                .entries()
                .iter()
                .filter(|e| e.state == EntryState::Completed)
                .map(|e| e.subtask.id.clone())
                .collect(),
        };

        let Some(context) = store.get_mut(task_id) else {
            anyhow::bail!("context {task_id} is not available for preparation");
        };
        let mut mapping = Map::new();
        for (key, (path, from_task, from_output)) in resolved {
            mapping.insert(key.clone(), json!(path));
            context.add_file_reference(
                &format!("input_{key}"),
                path,
                FileMetadata {
                    from_task,
                    from_output,
                    ..FileMetadata::with_role("input_file")
                },
            );
        }
        context.update_local(keys::INPUT_FILES_MAPPING, Value::Object(mapping));
        context.update_local(
            keys::PROGRESS,
            serde_json::to_value(&progress).context("serialize progress")?,
        );
        Ok(())
    }

    /// `task:output` through the producer's output reference, otherwise a literal path.
    fn resolve_input(
        &self,
        store: &ContextStore,
        spec: &str,
    ) -> (PathBuf, Option<String>, Option<String>) {
        if let Some((task, output)) = spec.split_once(':') {
            if let Some(producer) = self.plan.get(task) {
                let from_context = store
                    .get(task)
                    .and_then(|ctx| ctx.file_paths.get(&format!("output_{output}")))
                    .map(|reference| reference.path.clone());
                let from_plan = producer
                    .output_files
                    .get(output)
                    .map(|path| resolve_path(&self.run_root, path));
                match from_context.or(from_plan) {
                    Some(path) => return (path, Some(task.to_string()), Some(output.to_string())),
                    None => warn!(input = spec, "producer does not declare this output"),
                }
            }
        }
        (resolve_path(&self.run_root, spec), None, None)
    }

    /// Hand out the next subtask in plan order, propagating its predecessors first.
    ///
    /// Without declared dependencies the immediately preceding completed
    /// subtask is chained in; otherwise each completed dependency is.
    pub fn get_next_subtask(&mut self, store: &mut ContextStore) -> Result<Option<Subtask>> {
        let Some(subtask) = self.plan.next_sequential() else {
            return Ok(None);
        };
        self.set_phase(PlannerPhase::Executing);
        let target = [subtask.id.clone()];
        if subtask.dependencies.is_empty() {
            if let Some(previous) = self.plan.preceding_completed(&subtask.id) {
                let previous = previous.id.clone();
                store.propagate_results(&previous, &target, None, None)?;
            }
        } else {
            for dependency in &subtask.dependencies {
                if self.plan.state(dependency) == Some(EntryState::Completed) {
                    store.propagate_results(dependency, &target, None, None)?;
                }
            }
        }
        self.prepare_subtask(store, &subtask.id)?;
        Ok(Some(subtask))
    }

    /// Record a result, mirror it into the context and review the plan on failure.
    #[instrument(skip_all, fields(task = %result.task_id, success = result.success))]
    pub fn process_result(
        &mut self,
        store: &mut ContextStore,
        result: ExecutionResult,
    ) -> Result<Option<AdjustmentOutcome>> {
        let task_id = result.task_id.clone();
        self.plan.mark_completed(&task_id);
        let result_value = serde_json::to_value(&result).context("serialize result")?;
        let main_result = self
            .plan
            .get(&task_id)
            .and_then(Subtask::main_result_path)
            .map(|path| resolve_path(&self.run_root, path));

        if let Some(context) = store.get_mut(&task_id) {
            context.update_local(keys::SUCCESS, json!(result.success));
            context.update_local(keys::RESULT, result_value);
            context.update_local(keys::COMPLETION_TIME, json!(now_rfc3339()));
            match main_result.as_deref().and_then(read_json_file) {
                Some(data) => context.update_local(keys::RESULT_DATA, data),
                None => {
                    context.local_context.remove(keys::RESULT_DATA);
                }
            }
            let base_dir = context
                .base_dir
                .clone()
                .unwrap_or_else(|| self.run_root.join("results").join(&task_id));
            for (rel, path) in list_files(&base_dir) {
                if context.file_paths.values().any(|r| r.path == path) {
                    continue;
                }
                context.add_file_reference(
                    &format!("artifact_{rel}"),
                    path,
                    FileMetadata {
                        created_by: Some(task_id.clone()),
                        rel_path: Some(rel.clone()),
                        ..FileMetadata::with_role("artifact")
                    },
                );
            }
        } else {
            warn!(task = %task_id, "result for subtask without context");
        }

        store.ensure_context(PLANNER_CONTEXT).add_execution_record(
            "subtask_completed",
            &result.result.summary,
            Map::from_iter([
                ("task_id".to_string(), json!(task_id)),
                ("success".to_string(), json!(result.success)),
            ]),
        );

        let success = result.success;
        let next_steps = result.next_steps.clone().unwrap_or_default();
        self.results.insert(task_id.clone(), result.clone());

        if !success {
            self.set_phase(PlannerPhase::Evaluating);
            let outcome = self.evaluate_and_adjust_plan(store, &task_id, &result);
            self.set_phase(PlannerPhase::Executing);
            return Ok(Some(outcome));
        }

        if !next_steps.is_empty() {
            store.ensure_context(PLANNER_CONTEXT).add_execution_record(
                "task_suggestions",
                &format!("{} suggestions from {task_id}", next_steps.len()),
                Map::from_iter([("next_steps".to_string(), json!(next_steps))]),
            );
            write_json_atomic(
                &self.run_root.join(format!("suggestions_{task_id}.json")),
                &json!({ "task_id": task_id, "next_steps": next_steps }),
            )?;
        }
        Ok(None)
    }

    /// Ask the engine whether the remaining plan should change after a failure.
    ///
    /// Any problem with the review leaves the plan unchanged.
    #[instrument(skip_all, fields(task = task_id))]
    pub fn evaluate_and_adjust_plan(
        &mut self,
        store: &mut ContextStore,
        task_id: &str,
        result: &ExecutionResult,
    ) -> AdjustmentOutcome {
        let failure = json!({
            "error": result.error,
            "summary": result.result.summary,
            "details": result.result.details,
            "execution": store.execution_summary(task_id),
        });
        let completed: Vec<ResultLine> = self
            .plan
            .entries()
            .iter()
            .filter(|e| e.state == EntryState::Completed)
            .filter_map(|e| self.results.get(&e.subtask.id))
            .map(|r| ResultLine {
                task_id: r.task_id.clone(),
                success: r.success,
                summary: r.result.summary.clone(),
            })
            .collect();
        let remaining = serde_json::to_string_pretty(&self.plan.pending()).unwrap_or_default();

        let prompt = self.prompts.build_adjustment(&AdjustmentPromptInputs {
            task_description: &self.task_description,
            failed_task: task_id,
            failure: serde_json::to_string_pretty(&failure).unwrap_or_default(),
            completed,
            remaining,
        });
        let output = match prompt.map_err(|err| format!("{err:#}")).and_then(|p| self.ask(&p)) {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "plan review failed; keeping plan");
                self.note(store, "plan_adjustment_failed", &err);
                return AdjustmentOutcome::EngineFailed(err);
            }
        };

        let Some((decision, adjustment)) =
            find_json(&output).and_then(|value| parse_adjustment(&value).map(|adj| (value, adj)))
        else {
            warn!("plan review answer not understood; keeping plan");
            self.note(store, "plan_adjustment_unparsed", &first_chars(&output, 200));
            return AdjustmentOutcome::Unparsed;
        };

        if !adjustment.needs_adjustment {
            self.write_adjustment(task_id, &adjustment.reason, &decision, &AdjustmentReport::default());
            self.note(store, "plan_unchanged", &adjustment.reason);
            return AdjustmentOutcome::NotNeeded;
        }

        self.set_phase(PlannerPhase::Adjusting);
        let report = self.plan.apply(&adjustment);
        for id in &report.inserted {
            let Some(subtask) = self.plan.get(id).cloned() else {
                continue;
            };
            let prepared = self.create_context(store, &subtask, &Value::Null).and_then(|()| {
                if let Some(context) = store.get_mut(id) {
                    context.update_local(keys::CREATED_FROM_ADJUSTMENT, json!(true));
                    context.update_local(keys::PARENT_TASK, json!(task_id));
                }
                store.create_output_directories(std::slice::from_ref(&subtask))
            });
            if let Err(err) = prepared {
                warn!(task = %id, err = %format!("{err:#}"), "cannot prepare inserted subtask");
            }
        }
        for id in &report.modified {
            let Some(subtask) = self.plan.get(id).cloned() else {
                continue;
            };
            if let Err(err) = self.refresh_context(store, &subtask, &adjustment.reason) {
                warn!(task = %id, err = %format!("{err:#}"), "cannot refresh modified subtask");
            }
        }
        if !report.rejected.is_empty() {
            warn!(rejected = ?report.rejected, "some plan changes were rejected");
        }
        self.write_adjustment(task_id, &adjustment.reason, &decision, &report);
        let planner = store.ensure_context(PLANNER_CONTEXT);
        planner.update_local(
            keys::ADJUSTED_PLAN,
            serde_json::to_value(self.plan.subtasks()).unwrap_or(Value::Null),
        );
        planner.add_execution_record(
            "plan_adjusted",
            &adjustment.reason,
            Map::from_iter([
                ("inserted".to_string(), json!(report.inserted)),
                ("removed".to_string(), json!(report.removed)),
                ("modified".to_string(), json!(report.modified)),
                ("revision".to_string(), json!(self.plan.revision())),
            ]),
        );
        info!(revision = self.plan.revision(), ?report, "plan adjusted");
        AdjustmentOutcome::Applied(report)
    }

    /// Integrate every recorded result into the run's final result.
    ///
    /// Falls back to a result built from success counts when the engine is
    /// unavailable.
    #[instrument(skip_all)]
    pub fn get_final_result(&mut self, store: &mut ContextStore) -> Result<FinalResult> {
        self.set_phase(PlannerPhase::Finalizing);
        let succeeded = self.results.values().filter(|r| r.success).count();
        let counts = SubtaskCounts {
            total: self.plan.len(),
            succeeded,
            failed: self.results.len() - succeeded,
        };
        let subtask_results: BTreeMap<String, SubtaskOutcome> = self
            .results
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    SubtaskOutcome {
                        success: r.success,
                        summary: r.result.summary.clone(),
                    },
                )
            })
            .collect();
        let artifacts: BTreeMap<String, String> = self
            .results
            .iter()
            .flat_map(|(id, r)| {
                r.artifacts
                    .iter()
                    .map(move |(name, path)| (format!("{id}/{name}"), path.clone()))
            })
            .collect();

        let lines: Vec<ResultLine> = self
            .plan
            .entries()
            .iter()
            .filter_map(|e| self.results.get(&e.subtask.id))
            .map(|r| ResultLine {
                task_id: r.task_id.clone(),
                success: r.success,
                summary: r.result.summary.clone(),
            })
            .collect();
        let integrated = self
            .prompts
            .build_integration(&self.task_description, &lines)
            .map_err(|err| format!("{err:#}"))
            .and_then(|prompt| self.ask(&prompt))
            .map(|output| find_json(&output).ok_or(output));

        let fallback_summary = format!(
            "Completed {} of {} subtasks ({} failed)",
            counts.succeeded, counts.total, counts.failed
        );
        let final_result = match integrated {
            Ok(Ok(value)) => FinalResult {
                success: value
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(succeeded > 0),
                summary: value
                    .get("summary")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map_or_else(|| fallback_summary.clone(), str::to_string),
                details: value
                    .get("details")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                key_findings: value
                    .get("key_findings")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                artifacts,
                subtask_counts: counts,
                subtask_results,
            },
            Ok(Err(text)) => FinalResult {
                success: succeeded > 0,
                summary: fallback_summary,
                details: text,
                key_findings: Vec::new(),
                artifacts,
                subtask_counts: counts,
                subtask_results,
            },
            Err(err) => {
                warn!(error = %err, "integration failed; using counted result");
                FinalResult {
                    success: succeeded > 0,
                    summary: fallback_summary,
                    details: String::new(),
                    key_findings: Vec::new(),
                    artifacts,
                    subtask_counts: counts,
                    subtask_results,
                }
            }
        };

        let path = self.run_root.join(FINAL_RESULT_FILE);
        write_json_atomic(&path, &final_result)?;
        let planner = store.ensure_context(PLANNER_CONTEXT);
        planner.add_file_reference("final_result_file", &path, FileMetadata::with_role("final_result"));
        planner.update_local(
            keys::RESULT,
            serde_json::to_value(&final_result).context("serialize final result")?,
        );
        store.save_all()?;
        self.set_phase(PlannerPhase::Done);
        Ok(final_result)
    }

    /// One engine call; error text on failure.
    fn ask(&self, prompt: &str) -> std::result::Result<String, String> {
        match self.engine.invoke(&EngineRequest::new(prompt, self.timeout)) {
            Ok(response) if response.is_success() => Ok(response.output),
            Ok(response) => Err(response
                .error_msg
                .unwrap_or_else(|| "engine reported an error".to_string())),
            Err(err) => Err(err.to_string()),
        }
    }

    fn note(&self, store: &mut ContextStore, action: &str, detail: &str) {
        store
            .ensure_context(PLANNER_CONTEXT)
            .add_execution_record(action, detail, Map::new());
    }

    fn write_adjustment(&self, task_id: &str, reason: &str, decision: &Value, report: &AdjustmentReport) {
        let record = AdjustmentRecord {
            task_id,
            reason,
            decision,
            report,
            revision: self.plan.revision(),
            timestamp: now_rfc3339(),
        };
        let path = self.run_root.join(format!("adjustment_{task_id}.json"));
        if let Err(err) = write_json_atomic(&path, &record) {
            warn!(path = %path.display(), err = %format!("{err:#}"), "cannot write adjustment record");
        }
    }
}

/// `{subtasks: [...]}`, `{result: {subtasks: [...]}}` or a bare array.
fn subtask_list(value: &Value) -> Option<Vec<Value>> {
    let list = match value {
        Value::Array(items) => Some(items),
        Value::Object(_) => value
            .get("subtasks")
            .or_else(|| value.get("result").and_then(|r| r.get("subtasks")))
            .and_then(Value::as_array),
        _ => None,
    }?;
    Some(list.clone())
}

fn read_json_file(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn first_chars(text: &str, limit: usize) -> String {
    text.trim().chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::engine::{EngineError, EngineResponse};
    use crate::test_support::{ScriptedEngine, subtask, subtask_with_deps};

    fn planner<'a>(engine: &'a ScriptedEngine, root: &Path) -> Planner<&'a ScriptedEngine> {
        Planner::new("Summarize sales", engine, root, &RunConfig::default())
    }

    fn reply(text: &str) -> Result<EngineResponse, EngineError> {
        Ok(EngineResponse::success(text))
    }

    fn failed(task_id: &str) -> ExecutionResult {
        ExecutionResult::failure(task_id, "missing input", "")
    }

    fn ok(task_id: &str) -> ExecutionResult {
        let mut result = ExecutionResult::failure(task_id, "", "");
        result.success = true;
        result.error = None;
        result.result.summary = format!("{task_id} done");
        result
    }

    #[test]
    fn breakdown_normalizes_engine_subtasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::new(vec![
            reply("```json\n{\"summary\": \"sales report\", \"details\": \"load then report\"}\n```"),
            reply(
                "```json\n{\"subtasks\": [{\"id\": \"load\", \"name\": \"Load\", \"instruction\": \"load csv\"}, {\"name\": \"Report\", \"description\": \"write report\", \"dependencies\": [\"load\"]}]}\n```",
            ),
        ]);
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());

        let analysis = planner.analyze_task(&mut store);
        assert_eq!(analysis["summary"], "sales report");
        let subtasks = planner
            .break_down_task(&mut store, &analysis)
            .expect("breakdown");

        let ids: Vec<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["load", "task_2"]);
        assert!(subtasks.iter().all(|s| s.main_result_path().is_some()));
        assert_eq!(subtasks[1].instruction, "write report");
        assert_eq!(planner.phase(), PlannerPhase::Decomposed);

        let load = store.get("load").expect("load context");
        assert!(load.local(keys::TASK_DEFINITION).is_some());
        assert_eq!(load.local(keys::ANALYSIS_SUMMARY), Some(&json!("sales report")));
        assert!(load.file_paths.contains_key("output_main_result"));
        assert!(temp.path().join("subtasks/task_2.json").is_file());
        assert!(engine.requests()[1].prompt.contains("load then report"));
    }

    #[test]
    fn breakdown_falls_back_when_engine_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());

        let analysis = planner.analyze_task(&mut store);
        assert_eq!(analysis["success"], false);
        let subtasks = planner
            .break_down_task(&mut store, &analysis)
            .expect("breakdown");

        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].id, "fallback_task");
        assert_eq!(subtasks[0].instruction, "Summarize sales");
    }

    #[test]
    fn sequential_access_chains_previous_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner
            .install_plan(&mut store, vec![subtask("a"), subtask("b")])
            .expect("install");

        let first = planner.get_next_subtask(&mut store).expect("next").expect("a");
        assert_eq!(first.id, "a");
        store
            .get_mut("a")
            .expect("a")
            .update_local("rows", json!(42));
        planner.process_result(&mut store, ok("a")).expect("process");

        let second = planner.get_next_subtask(&mut store).expect("next").expect("b");
        assert_eq!(second.id, "b");
        let b = store.get("b").expect("b");
        assert_eq!(b.local("rows"), Some(&json!(42)));
        assert!(b.local(keys::DEPENDENCY_RESULTS).and_then(|d| d.get("a")).is_some());
        let progress: ProgressView =
            serde_json::from_value(b.local(keys::PROGRESS).cloned().expect("progress")).expect("parse");
        assert_eq!(progress.current_index, 2);
        assert_eq!(progress.completed_tasks, vec!["a"]);
        assert!(planner.get_next_subtask(&mut store).expect("next").is_none());
    }

    #[test]
    fn inputs_resolve_through_producer_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        let mut report = subtask_with_deps("report", &["load"]);
        report
            .input_files
            .insert("rows".to_string(), "load:main_result".to_string());
        report
            .input_files
            .insert("notes".to_string(), "docs/notes.md".to_string());
        planner
            .install_plan(&mut store, vec![subtask("load"), report])
            .expect("install");

        planner.prepare_subtask(&mut store, "report").expect("prepare");

        let context = store.get("report").expect("report");
        let rows = &context.file_paths["input_rows"];
        assert_eq!(rows.path, temp.path().join("results/load/result.json"));
        assert_eq!(rows.metadata.from_task.as_deref(), Some("load"));
        assert_eq!(
            context.file_paths["input_notes"].path,
            temp.path().join("docs/notes.md")
        );
        assert!(context.local(keys::INPUT_FILES_MAPPING).is_some());
    }

    #[test]
    fn process_result_mirrors_result_and_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner.install_plan(&mut store, vec![subtask("a")]).expect("install");
        fs::write(temp.path().join("results/a/result.json"), "{\"rows\": 3}").expect("write");
        fs::write(temp.path().join("results/a/chart.svg"), "<svg/>").expect("write");

        let mut result = ok("a");
        result.next_steps = Some(vec!["add charts".to_string()]);
        let outcome = planner.process_result(&mut store, result).expect("process");

        assert!(outcome.is_none());
        let a = store.get("a").expect("a");
        assert_eq!(a.local(keys::RESULT_DATA), Some(&json!({"rows": 3})));
        assert!(a.file_paths.contains_key("artifact_chart.svg"));
        assert!(!a.file_paths.contains_key("artifact_result.json"));
        assert!(temp.path().join("suggestions_a.json").is_file());
        assert_eq!(planner.plan().state("a"), Some(EntryState::Completed));
    }

    /// A failure review that inserts a fix task rewires the dependent and keeps executed work.
    #[test]
    fn failure_review_applies_adjustment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::new(vec![reply(
            "```json\n{\"needs_adjustment\": true, \"reason\": \"need data\", \"insert_tasks\": [{\"id\": \"fetch\", \"name\": \"Fetch\", \"instruction\": \"download\", \"insert_index\": 0}], \"modify_tasks\": [{\"id\": \"report\", \"dependencies\": [\"load\", \"fetch\"]}], \"remove_tasks\": [\"load\"]}\n```",
        )]);
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner
            .install_plan(&mut store, vec![subtask("load"), subtask_with_deps("report", &["load"])])
            .expect("install");
        planner.plan_mut().mark_scheduled("load");

        let outcome = planner
            .process_result(&mut store, failed("load"))
            .expect("process");

        let Some(AdjustmentOutcome::Applied(report)) = outcome else {
            panic!("expected applied adjustment, got {outcome:?}");
        };
        assert_eq!(report.inserted, vec!["fetch"]);
        assert_eq!(report.modified, vec!["report"]);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].starts_with("remove load"));
        let ids: Vec<&str> = planner
            .plan()
            .entries()
            .iter()
            .map(|e| e.subtask.id.as_str())
            .collect();
        assert_eq!(ids, vec!["load", "fetch", "report"]);
        let fetch = store.get("fetch").expect("fetch context");
        assert_eq!(fetch.local(keys::CREATED_FROM_ADJUSTMENT), Some(&json!(true)));
        assert_eq!(fetch.local(keys::PARENT_TASK), Some(&json!("load")));
        assert!(temp.path().join("adjustment_load.json").is_file());
        assert_eq!(planner.plan().revision(), 1);
    }

    /// A modified subtask's context carries the new definition and output paths.
    #[test]
    fn modified_subtask_context_is_refreshed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::new(vec![reply(
            "```json\n{\"needs_adjustment\": true, \"reason\": \"use cached rows\", \"modify_tasks\": [{\"id\": \"b\", \"instruction\": \"read the cache\", \"output_files\": {\"main_result\": \"cache/b.json\"}}]}\n```",
        )]);
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner
            .install_plan(&mut store, vec![subtask("a"), subtask_with_deps("b", &["a"])])
            .expect("install");
        planner.plan_mut().mark_scheduled("a");

        let outcome = planner.process_result(&mut store, failed("a")).expect("process");

        let Some(AdjustmentOutcome::Applied(report)) = outcome else {
            panic!("expected applied adjustment, got {outcome:?}");
        };
        assert_eq!(report.modified, vec!["b"]);
        let b = store.get("b").expect("b");
        assert_eq!(
            b.local(keys::TASK_DEFINITION).and_then(|d| d["instruction"].as_str()),
            Some("read the cache")
        );
        assert_eq!(b.local(keys::MODIFIED_FROM_ADJUSTMENT), Some(&json!(true)));
        assert_eq!(b.local(keys::MODIFICATION_REASON), Some(&json!("use cached rows")));
        assert_eq!(
            b.file_paths["output_main_result"].path,
            temp.path().join("cache/b.json")
        );
        assert!(!b.file_paths.values().any(|r| r.path.ends_with("results/b/result.json")));
        assert!(temp.path().join("cache").is_dir());
    }

    /// A dependent whose result is not JSON ends up with no `result_data` of its own.
    #[test]
    fn non_json_result_leaves_no_result_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner
            .install_plan(&mut store, vec![subtask("a"), subtask_with_deps("b", &["a"])])
            .expect("install");
        fs::write(temp.path().join("results/a/result.json"), "{\"rows\": 3}").expect("write");
        planner.plan_mut().mark_scheduled("a");
        planner.process_result(&mut store, ok("a")).expect("process a");
        store
            .propagate_results("a", &["b".to_string()], None, None)
            .expect("propagate");
        store
            .get_mut("b")
            .expect("b")
            .update_local(keys::RESULT_DATA, json!({"stale": true}));
        fs::write(temp.path().join("results/b/result.json"), "plain text report").expect("write");

        planner.plan_mut().mark_scheduled("b");
        planner.process_result(&mut store, ok("b")).expect("process b");

        let b = store.get("b").expect("b");
        assert_eq!(b.local(keys::RESULT_DATA), None);
        assert_eq!(
            store.execution_summary("b").and_then(|s| s.result_data),
            None
        );
        assert_eq!(
            b.local(keys::DEPENDENCY_RESULTS).and_then(|d| d["a"]["success"].as_bool()),
            Some(true)
        );
    }

    #[test]
    fn unparsed_review_keeps_plan_and_is_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::new(vec![reply("I think it is probably fine.")]);
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner
            .install_plan(&mut store, vec![subtask("a"), subtask("b")])
            .expect("install");

        let outcome = planner.process_result(&mut store, failed("a")).expect("process");

        assert_eq!(outcome, Some(AdjustmentOutcome::Unparsed));
        assert_eq!(planner.plan().revision(), 0);
        let actions: Vec<&str> = store
            .get(PLANNER_CONTEXT)
            .expect("planner")
            .execution_history
            .iter()
            .map(|r| r.action.as_str())
            .collect();
        assert!(actions.contains(&"plan_adjustment_unparsed"));
    }

    #[test]
    fn review_engine_failure_keeps_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner.install_plan(&mut store, vec![subtask("a")]).expect("install");

        let outcome = planner.process_result(&mut store, failed("a")).expect("process");
        assert!(matches!(outcome, Some(AdjustmentOutcome::EngineFailed(_))));
    }

    /// With the engine unavailable the final result is still produced from counts.
    #[test]
    fn final_result_falls_back_to_counts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner
            .install_plan(&mut store, vec![subtask("a"), subtask("b")])
            .expect("install");
        planner.results.insert("a".to_string(), ok("a"));
        planner.results.insert("b".to_string(), failed("b"));

        let result = planner.get_final_result(&mut store).expect("final");

        assert!(result.success);
        assert_eq!(result.summary, "Completed 1 of 2 subtasks (1 failed)");
        assert_eq!(result.subtask_counts.failed, 1);
        assert!(temp.path().join(FINAL_RESULT_FILE).is_file());
        assert!(temp.path().join("contexts/global_context.json").is_file());
        assert_eq!(planner.phase(), PlannerPhase::Done);
    }

    #[test]
    fn final_result_uses_integration_answer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::new(vec![reply(
            "```json\n{\"summary\": \"Sales grew\", \"details\": \"Q3 best\", \"key_findings\": [\"Q3\"]}\n```",
        )]);
        let mut store = ContextStore::new(temp.path());
        let mut planner = planner(&engine, temp.path());
        planner.install_plan(&mut store, vec![subtask("a")]).expect("install");
        planner.results.insert("a".to_string(), ok("a"));

        let result = planner.get_final_result(&mut store).expect("final");

        assert_eq!(result.summary, "Sales grew");
        assert_eq!(result.key_findings, vec!["Q3"]);
        assert!(engine.requests()[0].prompt.contains("`a` (succeeded): a done"));
    }

    #[test]
    fn restore_rebuilds_results_from_contexts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut original = planner(&engine, temp.path());
        original
            .install_plan(&mut store, vec![subtask("a"), subtask("b")])
            .expect("install");
        original.plan_mut().mark_scheduled("a");
        original.process_result(&mut store, ok("a")).expect("process");
        original.plan_mut().mark_scheduled("b");

        let restored = Planner::restore(
            "Summarize sales",
            &engine,
            temp.path(),
            &RunConfig::default(),
            original.plan().clone(),
            &store,
        );

        assert_eq!(restored.results().len(), 1);
        assert_eq!(restored.plan().state("b"), Some(EntryState::Pending));
        assert_eq!(restored.phase(), PlannerPhase::Executing);
    }
}
