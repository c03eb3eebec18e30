//! Dependency-batched execution of a plan.
//!
//! The scheduling thread owns the [`ContextStore`] and the planner. For each
//! batch it checks the batch's contexts out, hands them to workers, checks
//! them back in and only then records results and propagates them. Workers
//! never touch the store, so a running subtask cannot observe a half-applied
//! propagation.
//!
//! A plan adjustment (new revision) ends the current schedule; the remaining
//! pending subtasks are batched again against what has already completed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::{Map, json};
use tracing::{debug, info, instrument, warn};

use crate::agents::executor::SubtaskExecutor;
use crate::agents::planner::{PLANNER_CONTEXT, Planner};
use crate::core::graph::{ScheduleDiagnostic, schedule_remaining};
use crate::core::plan::EntryState;
use crate::core::types::{ExecutionResult, Subtask};
use crate::io::config::SchedulerConfig;
use crate::io::context::{ContextStore, TaskContext, keys};
use crate::io::engine::ReasoningEngine;
use crate::io::now_rfc3339;
use crate::io::plan_store::{PLAN_FILE, write_plan};
use crate::io::run_state::{
    PROGRESS_FILE, Progress, RUN_STATE_FILE, RunState, write_progress, write_run_state,
};

/// What one executed batch looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub task_ids: Vec<String>,
    pub successes: usize,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(duration.as_secs_f64())
    }
}

type Job = (usize, Subtask, TaskContext);
type Finished = (usize, ExecutionResult, TaskContext);

pub struct DependencyScheduler {
    run_root: PathBuf,
    max_workers: usize,
    parallel_threshold: usize,
}

impl DependencyScheduler {
    pub fn new(run_root: impl Into<PathBuf>, config: &SchedulerConfig) -> Self {
        Self {
            run_root: run_root.into(),
            max_workers: config.max_workers.max(1),
            parallel_threshold: config.parallel_threshold,
        }
    }

    /// Execute every pending subtask in dependency order.
    #[instrument(skip_all)]
    pub fn run<P, E>(
        &self,
        planner: &mut Planner<P>,
        executor: &SubtaskExecutor<E>,
        store: &mut ContextStore,
        state: &mut RunState,
    ) -> Result<Vec<BatchReport>>
    where
        P: ReasoningEngine,
        E: ReasoningEngine,
    {
        let mut reports = Vec::new();
        loop {
            let pending = planner.plan().pending();
            if pending.is_empty() {
                break;
            }
            let satisfied: HashSet<String> = planner.plan().completed_ids();
            let schedule = schedule_remaining(&pending, &satisfied);
            record_diagnostics(store, &schedule.diagnostics);
            if schedule.batches.is_empty() {
                warn!(pending = pending.len(), "nothing schedulable; stopping");
                break;
            }
            info!(
                batches = schedule.batches.len(),
                revision = planner.plan().revision(),
                "scheduled remaining subtasks"
            );

            let revision = planner.plan().revision();
            for batch in &schedule.batches {
                let report = self.run_batch(reports.len(), batch, planner, executor, store)?;
                info!(
                    batch = report.index,
                    tasks = report.task_ids.len(),
                    successes = report.successes,
                    secs = report.duration.as_secs_f64(),
                    "batch finished"
                );
                reports.push(report);
                state.completed_batches += 1;
                persist_run(&self.run_root, planner, store, state)?;
                if planner.plan().revision() != revision {
                    info!(revision = planner.plan().revision(), "plan changed; rescheduling");
                    break;
                }
            }
        }
        Ok(reports)
    }

    fn run_batch<P, E>(
        &self,
        index: usize,
        batch: &[String],
        planner: &mut Planner<P>,
        executor: &SubtaskExecutor<E>,
        store: &mut ContextStore,
    ) -> Result<BatchReport>
    where
        P: ReasoningEngine,
        E: ReasoningEngine,
    {
        let started = Instant::now();
        let mut jobs: Vec<Job> = Vec::with_capacity(batch.len());
        for id in batch {
            let Some(subtask) = planner.plan().get(id).cloned() else {
                warn!(task = %id, "scheduled subtask left the plan");
                continue;
            };
            planner.plan_mut().mark_scheduled(id);
            catch_up_dependencies(planner, store, &subtask)?;
            planner.prepare_subtask(store, id)?;
            let context = store.checkout(id)?;
            jobs.push((jobs.len(), subtask, context));
        }
        let task_ids: Vec<String> = jobs.iter().map(|(_, s, _)| s.id.clone()).collect();

        let mut finished = if jobs.len() < self.parallel_threshold || self.max_workers == 1 {
            debug!(tasks = jobs.len(), "running batch inline");
            jobs.into_iter()
                .map(|(i, subtask, mut context)| {
                    let result = executor.execute_subtask(&subtask, &mut context);
                    (i, result, context)
                })
                .collect()
        } else {
            self.run_pool(jobs, executor)?
        };
        finished.sort_by_key(|(i, _, _)| *i);

        let mut results = Vec::with_capacity(finished.len());
        for (_, result, context) in finished {
            store.check_in(context);
            results.push(result);
        }

        let successes = results.iter().filter(|r| r.success).count();
        for result in results {
            let task_id = result.task_id.clone();
            planner.process_result(store, result)?;
            let dependents: Vec<String> = planner
                .plan()
                .entries()
                .iter()
                .filter(|e| e.state == EntryState::Pending && e.subtask.dependencies.contains(&task_id))
                .map(|e| e.subtask.id.clone())
                .collect();
            if !dependents.is_empty() {
                store.propagate_results(&task_id, &dependents, None, None)?;
            }
        }

        Ok(BatchReport {
            index,
            task_ids,
            successes,
            duration: started.elapsed(),
        })
    }

    fn run_pool<E: ReasoningEngine>(
        &self,
        jobs: Vec<Job>,
        executor: &SubtaskExecutor<E>,
    ) -> Result<Vec<Finished>> {
        let workers = self.max_workers.min(jobs.len()).max(1);
        let expected = jobs.len();
        debug!(tasks = expected, workers, "running batch on worker pool");

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<Finished>();
        for job in jobs {
            job_tx
                .send(job)
                .map_err(|_| anyhow!("worker queue closed"))?;
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for (i, subtask, mut context) in &job_rx {
                        let result = executor.execute_subtask(&subtask, &mut context);
                        if done_tx.send((i, result, context)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(done_tx);

        let finished: Vec<Finished> = done_rx.try_iter().collect();
        if finished.len() != expected {
            return Err(anyhow!(
                "worker pool returned {} of {expected} subtasks",
                finished.len()
            ));
        }
        Ok(finished)
    }
}

/// Propagate completed dependencies a context has not received yet.
///
/// Covers subtasks inserted by an adjustment and runs resumed from disk.
fn catch_up_dependencies<P: ReasoningEngine>(
    planner: &Planner<P>,
    store: &mut ContextStore,
    subtask: &Subtask,
) -> Result<()> {
    let target = [subtask.id.clone()];
    for dependency in &subtask.dependencies {
        if planner.plan().state(dependency) != Some(EntryState::Completed) {
            continue;
        }
        let received = store
            .get(&subtask.id)
            .and_then(|ctx| ctx.local(keys::DEPENDENCY_RESULTS))
            .is_some_and(|results| results.get(dependency).is_some());
        if !received {
            store.propagate_results(dependency, &target, None, None)?;
        }
    }
    Ok(())
}

/// Write contexts, plan, progress and run state after a unit of work.
pub fn persist_run<P: ReasoningEngine>(
    run_root: &std::path::Path,
    planner: &Planner<P>,
    store: &ContextStore,
    state: &mut RunState,
) -> Result<()> {
    store.save_all()?;
    write_plan(&run_root.join(PLAN_FILE), planner.plan()).context("persist plan")?;

    let mut progress = Progress {
        total_tasks: planner.plan().len(),
        updated_at: now_rfc3339(),
        ..Progress::default()
    };
    for entry in planner.plan().entries() {
        let id = entry.subtask.id.clone();
        match (entry.state, planner.results().get(&id)) {
            (EntryState::Completed, Some(result)) if result.success => progress.completed.push(id),
            (EntryState::Completed, _) => progress.failed.push(id),
            _ => progress.pending.push(id),
        }
    }
    write_progress(&run_root.join(PROGRESS_FILE), &progress)?;

    state.phase = planner.phase();
    state.plan_revision = planner.plan().revision();
    state.updated_at = now_rfc3339();
    write_run_state(&run_root.join(RUN_STATE_FILE), state)
}

/// Surface scheduling diagnostics in the planner context's execution history.
fn record_diagnostics(store: &mut ContextStore, diagnostics: &[ScheduleDiagnostic]) {
    for diagnostic in diagnostics {
        let (action, result, metadata) = match diagnostic {
            ScheduleDiagnostic::Cycle { tasks } => (
                "schedule_cycle",
                format!("cycle among {} subtasks; running them as one batch", tasks.len()),
                Map::from_iter([("tasks".to_string(), json!(tasks))]),
            ),
            ScheduleDiagnostic::UnknownDependency { task, dependency } => (
                "schedule_unknown_dependency",
                format!("{task} depends on unknown {dependency}; ignored"),
                Map::from_iter([
                    ("task_id".to_string(), json!(task)),
                    ("dependency".to_string(), json!(dependency)),
                ]),
            ),
        };
        store
            .ensure_context(PLANNER_CONTEXT)
            .add_execution_record(action, &result, metadata);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::io::config::RunConfig;
    use crate::io::engine::EngineResponse;
    use crate::io::run_state::load_run_state;
    use crate::test_support::{
        ScriptedEngine, failure_output, prompt_task_id, subtask, subtask_with_deps, success_output,
    };

    fn config(workers: usize) -> RunConfig {
        let mut config = RunConfig::default();
        config.scheduler.max_workers = workers;
        config.scheduler.parallel_threshold = 2;
        config.executor.backoff_base_ms = 1;
        config.executor.backoff_max_ms = 1;
        config
    }

    fn succeed_all() -> ScriptedEngine {
        ScriptedEngine::responding(|request| {
            let id = prompt_task_id(&request.prompt).unwrap_or("unknown").to_string();
            Ok(EngineResponse::success(success_output(&id, &format!("{id} ok"))))
        })
    }

    /// Diamond a -> {b, c} -> d runs in three batches and d sees both parents.
    #[test]
    fn diamond_runs_in_dependency_batches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(4);
        let engine = succeed_all();
        let planner_engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = Planner::new("diamond", &planner_engine, temp.path(), &config);
        planner
            .install_plan(
                &mut store,
                vec![
                    subtask("a"),
                    subtask_with_deps("b", &["a"]),
                    subtask_with_deps("c", &["a"]),
                    subtask_with_deps("d", &["b", "c"]),
                ],
            )
            .expect("install");
        let executor = SubtaskExecutor::new(&engine, temp.path(), &config);
        let scheduler = DependencyScheduler::new(temp.path(), &config.scheduler);
        let mut state = RunState::default();

        let reports = scheduler
            .run(&mut planner, &executor, &mut store, &mut state)
            .expect("run");

        let batches: Vec<Vec<String>> = reports.iter().map(|r| r.task_ids.clone()).collect();
        assert_eq!(batches, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert!(reports.iter().all(|r| r.successes == r.task_ids.len()));
        let d = store.get("d").expect("d");
        let deps = d.local(keys::DEPENDENCY_RESULTS).expect("dependency results");
        assert_eq!(deps["b"]["summary"], json!("b ok"));
        assert_eq!(deps["c"]["summary"], json!("c ok"));
        assert!(planner.plan().is_complete());
        assert_eq!(state.completed_batches, 3);
        let saved = load_run_state(&temp.path().join(RUN_STATE_FILE)).expect("run state");
        assert_eq!(saved.completed_batches, 3);
        assert!(temp.path().join(PROGRESS_FILE).is_file());
        assert!(temp.path().join(PLAN_FILE).is_file());
    }

    /// Members of one batch run concurrently on the pool.
    #[test]
    fn independent_subtasks_run_concurrently() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let engine = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            ScriptedEngine::responding(move |request| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
                let id = prompt_task_id(&request.prompt).unwrap_or("unknown").to_string();
                Ok(EngineResponse::success(success_output(&id, "ok")))
            })
        };
        let planner_engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = Planner::new("wide", &planner_engine, temp.path(), &config);
        planner
            .install_plan(&mut store, vec![subtask("x"), subtask("y"), subtask("z")])
            .expect("install");
        let executor = SubtaskExecutor::new(&engine, temp.path(), &config);

        let reports = DependencyScheduler::new(temp.path(), &config.scheduler)
            .run(&mut planner, &executor, &mut store, &mut RunState::default())
            .expect("run");

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task_ids, vec!["x", "y", "z"]);
        assert!(peak.load(Ordering::SeqCst) >= 2);
        assert!(store.task_ids().all(|id| !store.is_checked_out(id)));
    }

    /// A failure that inserts a fix task triggers rescheduling of the rest.
    #[test]
    fn adjustment_reschedules_remaining_work() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = {
            let seen = Arc::clone(&seen);
            ScriptedEngine::responding(move |request| {
                let id = prompt_task_id(&request.prompt).unwrap_or("unknown").to_string();
                seen.lock().expect("seen").push(id.clone());
                if id == "load" {
                    Ok(EngineResponse::success(failure_output(&id, "no data")))
                } else {
                    Ok(EngineResponse::success(success_output(&id, "ok")))
                }
            })
        };
        let planner_engine = ScriptedEngine::new(vec![Ok(EngineResponse::success(
            "```json\n{\"needs_adjustment\": true, \"reason\": \"fetch first\", \"insert_tasks\": [{\"id\": \"fetch\", \"name\": \"Fetch\", \"instruction\": \"download\"}], \"modify_tasks\": [{\"id\": \"report\", \"dependencies\": [\"fetch\"]}]}\n```",
        ))]);
        let mut store = ContextStore::new(temp.path());
        let mut planner = Planner::new("sales", &planner_engine, temp.path(), &config);
        planner
            .install_plan(&mut store, vec![subtask("load"), subtask_with_deps("report", &["load"])])
            .expect("install");
        let executor = SubtaskExecutor::new(&engine, temp.path(), &config);

        let reports = DependencyScheduler::new(temp.path(), &config.scheduler)
            .run(&mut planner, &executor, &mut store, &mut RunState::default())
            .expect("run");

        assert_eq!(*seen.lock().expect("seen"), vec!["load", "fetch", "report"]);
        assert_eq!(reports.len(), 3);
        assert_eq!(planner.plan().revision(), 1);
        let report_ctx = store.get("report").expect("report");
        assert!(
            report_ctx
                .local(keys::DEPENDENCY_RESULTS)
                .and_then(|d| d.get("fetch"))
                .is_some()
        );
        assert!(temp.path().join("adjustment_load.json").is_file());
    }

    #[test]
    fn failed_subtask_is_recorded_in_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(1);
        let engine = ScriptedEngine::responding(|request| {
            let id = prompt_task_id(&request.prompt).unwrap_or("unknown").to_string();
            Ok(EngineResponse::success(failure_output(&id, "broken")))
        });
        let planner_engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = Planner::new("t", &planner_engine, temp.path(), &config);
        planner.install_plan(&mut store, vec![subtask("a")]).expect("install");
        let executor = SubtaskExecutor::new(&engine, temp.path(), &config);

        DependencyScheduler::new(temp.path(), &config.scheduler)
            .run(&mut planner, &executor, &mut store, &mut RunState::default())
            .expect("run");

        let progress: Progress = serde_json::from_str(
            &std::fs::read_to_string(temp.path().join(PROGRESS_FILE)).expect("read"),
        )
        .expect("parse");
        assert_eq!(progress.failed, vec!["a"]);
        assert!(progress.pending.is_empty());
        let history = &store.get(PLANNER_CONTEXT).expect("planner").execution_history;
        assert!(history.iter().any(|r| r.action == "plan_adjustment_failed"));
    }
    fn planner_actions(store: &ContextStore) -> Vec<String> {
        store
            .get(PLANNER_CONTEXT)
            .map(|planner| {
                planner
                    .execution_history
                    .iter()
                    .map(|r| r.action.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A two-task cycle runs as one batch and the cycle is recorded for the planner.
    #[test]
    fn cycle_is_recorded_in_planner_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(2);
        let engine = succeed_all();
        let planner_engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = Planner::new("cycle", &planner_engine, temp.path(), &config);
        planner
            .install_plan(
                &mut store,
                vec![subtask_with_deps("a", &["b"]), subtask_with_deps("b", &["a"])],
            )
            .expect("install");
        let executor = SubtaskExecutor::new(&engine, temp.path(), &config);
        let scheduler = DependencyScheduler::new(temp.path(), &config.scheduler);

        let reports = scheduler
            .run(&mut planner, &executor, &mut store, &mut RunState::default())
            .expect("run");

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task_ids, vec!["a", "b"]);
        assert!(planner_actions(&store).contains(&"schedule_cycle".to_string()));
        let record = store
            .get(PLANNER_CONTEXT)
            .and_then(|p| p.execution_history.iter().find(|r| r.action == "schedule_cycle"))
            .expect("cycle record");
        assert_eq!(record.metadata["tasks"], json!(["a", "b"]));
    }

    #[test]
    fn unknown_dependency_is_recorded_in_planner_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(1);
        let engine = succeed_all();
        let planner_engine = ScriptedEngine::unavailable();
        let mut store = ContextStore::new(temp.path());
        let mut planner = Planner::new("ghost", &planner_engine, temp.path(), &config);
        planner
            .install_plan(&mut store, vec![subtask_with_deps("a", &["ghost"])])
            .expect("install");
        let executor = SubtaskExecutor::new(&engine, temp.path(), &config);
        let scheduler = DependencyScheduler::new(temp.path(), &config.scheduler);

        scheduler
            .run(&mut planner, &executor, &mut store, &mut RunState::default())
            .expect("run");

        assert!(planner.plan().is_complete());
        assert!(planner_actions(&store).contains(&"schedule_unknown_dependency".to_string()));
    }
}
