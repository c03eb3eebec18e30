//! Executor agent: runs one subtask against the reasoning engine.
//!
//! The executor never returns an error. Engine failures, unparseable output
//! and missing outputs all become a failed [`ExecutionResult`] recorded in the
//! subtask's context, leaving retry-vs-replan policy to the planner.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{extract, file_blocks, normalize_result};
use crate::core::retry::{CallOutcome, FailReason, InvocationMachine, Next, RetryPolicy};
use crate::core::types::{ExecutionResult, Subtask, TaskStatus};
use crate::io::artifacts::{ensure_output_dirs, missing_outputs, resolve_path, write_file_blocks};
use crate::io::config::RunConfig;
use crate::io::context::{FileContent, FileMetadata, TaskContext, keys};
use crate::io::engine::{EngineError, EngineRequest, ReasoningEngine, Role, Turn};
use crate::io::interaction_log::{InteractionWriteRequest, write_interaction};
use crate::io::prompt::{
    CONTINUATION_PROMPT, DependencyView, ExecutorPromptInputs, InputView, OutputView,
    ProgressView, PromptBuilder,
};

/// Dependency details longer than this are left out of prompts.
const DETAILS_INLINE_LIMIT: usize = 500;

/// Engine output accumulated over all continuation rounds.
#[derive(Debug, Clone)]
struct Invocation {
    combined_output: String,
    task_status: Option<TaskStatus>,
    conversation: Vec<Turn>,
}

/// Runs subtasks against a reasoning engine.
#[derive(Debug, Clone)]
pub struct SubtaskExecutor<E> {
    engine: E,
    run_root: PathBuf,
    prompts: PromptBuilder,
    policy: RetryPolicy,
    default_timeout: Duration,
    inline_file_limit_bytes: usize,
}

impl<E: ReasoningEngine> SubtaskExecutor<E> {
    pub fn new(engine: E, run_root: impl Into<PathBuf>, config: &RunConfig) -> Self {
        Self {
            engine,
            run_root: run_root.into(),
            prompts: PromptBuilder::new(config.prompt.budget_bytes),
            policy: config.retry_policy(),
            default_timeout: config.engine_timeout(),
            inline_file_limit_bytes: config.executor.inline_file_limit_bytes,
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    /// Execute `subtask`, recording everything into `context`.
    #[instrument(skip_all, fields(task = %subtask.id))]
    pub fn execute_subtask(&self, subtask: &Subtask, context: &mut TaskContext) -> ExecutionResult {
        let base_dir = context
            .base_dir
            .clone()
            .unwrap_or_else(|| self.run_root.join("results").join(&subtask.id));
        context.add_execution_record("execution_started", &subtask.name, Map::new());

        if let Err(err) = ensure_output_dirs(&self.run_root, subtask) {
            let result = ExecutionResult::failure(&subtask.id, format!("{err:#}"), "");
            self.record(subtask, context, "", "", &result, None, &[]);
            return result;
        }

        let prompt = match self.prompts.build_executor(&self.prompt_inputs(subtask, context, &base_dir)) {
            Ok(prompt) => prompt,
            Err(err) => {
                let result =
                    ExecutionResult::failure(&subtask.id, format!("render prompt: {err:#}"), "");
                self.record(subtask, context, "", "", &result, None, &[]);
                return result;
            }
        };

        let invocation = match self.invoke(subtask, &prompt, context) {
            Ok(invocation) => invocation,
            Err(result) => {
                self.record(subtask, context, &prompt, "", &result, None, &[]);
                return result;
            }
        };

        let output = &invocation.combined_output;
        let mut result = normalize_result(&subtask.id, extract(output));
        let written = write_file_blocks(&self.run_root, subtask, &base_dir, &file_blocks(output));
        for (name, path) in &written {
            result
                .artifacts
                .insert(name.clone(), path.display().to_string());
        }

        let missing = missing_outputs(&self.run_root, subtask);
        if !missing.is_empty() {
            let listing: Vec<String> = missing
                .iter()
                .map(|(name, path)| format!("{name}: {}", path.display()))
                .collect();
            warn!(missing = ?listing, "declared outputs missing after execution");
            result.fail_with(format!("missing output files: {}", listing.join(", ")));
        }

        info!(success = result.success, summary = %result.result.summary, "subtask finished");
        self.record(
            subtask,
            context,
            &prompt,
            output,
            &result,
            invocation.task_status,
            &invocation.conversation,
        );
        result
    }

    /// Drive the retry/continuation state machine until a final response or failure.
    fn invoke(
        &self,
        subtask: &Subtask,
        prompt: &str,
        context: &mut TaskContext,
    ) -> Result<Invocation, ExecutionResult> {
        let timeout = subtask
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs);
        let mut machine = InvocationMachine::new(self.policy);
        let mut request = EngineRequest::new(prompt, timeout);
        let mut outputs: Vec<String> = Vec::new();
        let mut last_error = String::new();

        loop {
            let response = self.engine.invoke(&request);
            let outcome = match &response {
                Ok(resp) if resp.is_success() => CallOutcome::Responded(resp.task_status),
                Ok(resp) => {
                    last_error = resp
                        .error_msg
                        .clone()
                        .unwrap_or_else(|| "engine reported an error".to_string());
                    CallOutcome::Transient
                }
                Err(EngineError::Timeout { .. }) => CallOutcome::TimedOut,
                Err(err @ EngineError::Invocation(_)) => {
                    last_error = err.to_string();
                    CallOutcome::Transient
                }
            };
            context.add_execution_record(
                "engine_invoked",
                match &response {
                    Ok(resp) if resp.is_success() => "success",
                    Ok(_) => "error",
                    Err(_) => "failed",
                },
                meta([("phase", json!(format!("{:?}", machine.phase())))]),
            );

            match machine.on_outcome(outcome) {
                Next::Retry { after } => {
                    warn!(attempt = machine.retries(), error = %last_error, backoff_ms = after.as_millis() as u64, "retrying engine call");
                    context.add_execution_record(
                        "engine_retry",
                        &last_error,
                        meta([
                            ("attempt", json!(machine.retries())),
                            ("backoff_ms", json!(after.as_millis() as u64)),
                        ]),
                    );
                    thread::sleep(after);
                }
                Next::Continue => {
                    let output = response.map(|r| r.output).unwrap_or_default();
                    debug!(round = machine.continuations(), "engine asked to continue");
                    context.add_execution_record(
                        "task_continued",
                        "continuation requested",
                        meta([("round", json!(machine.continuations()))]),
                    );
                    request.conversation.push(Turn {
                        role: Role::User,
                        content: request.prompt.clone(),
                    });
                    request.conversation.push(Turn {
                        role: Role::Engine,
                        content: output.clone(),
                    });
                    request.prompt = CONTINUATION_PROMPT.to_string();
                    outputs.push(output);
                }
                Next::Done => {
                    let (output, task_status) = response
                        .map(|r| (r.output, r.task_status))
                        .unwrap_or_default();
                    let mut conversation = request.conversation;
                    conversation.push(Turn {
                        role: Role::User,
                        content: request.prompt,
                    });
                    conversation.push(Turn {
                        role: Role::Engine,
                        content: output.clone(),
                    });
                    outputs.push(output);
                    return Ok(Invocation {
                        combined_output: outputs.join("\n\n"),
                        task_status,
                        conversation,
                    });
                }
                Next::Fail(FailReason::Timeout) => {
                    warn!(timeout_secs = timeout.as_secs(), "engine call timed out");
                    return Err(ExecutionResult::failure(
                        &subtask.id,
                        "timeout",
                        format!("engine call exceeded {}s", timeout.as_secs()),
                    ));
                }
                Next::Fail(FailReason::RetriesExhausted) => {
                    warn!(retries = machine.retries(), error = %last_error, "engine retries exhausted");
                    return Err(ExecutionResult::failure(
                        &subtask.id,
                        last_error,
                        format!("gave up after {} retries", machine.retries()),
                    ));
                }
            }
        }
    }

    fn prompt_inputs<'a>(
        &self,
        subtask: &'a Subtask,
        context: &TaskContext,
        base_dir: &Path,
    ) -> ExecutorPromptInputs<'a> {
        let outputs = subtask
            .output_files
            .iter()
            .map(|(name, path)| OutputView {
                name: name.clone(),
                path: resolve_path(&self.run_root, path).display().to_string(),
            })
            .collect();

        let progress = context
            .local(keys::PROGRESS)
            .and_then(|value| serde_json::from_value::<ProgressView>(value.clone()).ok());

        let dependencies = context
            .local(keys::DEPENDENCY_RESULTS)
            .and_then(Value::as_object)
            .map(|results| {
                results
                    .iter()
                    .map(|(task_id, entry)| DependencyView {
                        task_id: task_id.clone(),
                        success: entry.get("success").and_then(Value::as_bool).unwrap_or(false),
                        summary: entry
                            .get("summary")
                            .and_then(Value::as_str)
                            .unwrap_or("no summary")
                            .to_string(),
                        details: entry
                            .get("details")
                            .and_then(Value::as_str)
                            .filter(|d| !d.is_empty() && d.len() <= DETAILS_INLINE_LIMIT)
                            .map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ExecutorPromptInputs {
            subtask,
            workdir: self.run_root.display().to_string(),
            task_dir: resolve_path(&self.run_root, base_dir).display().to_string(),
            outputs,
            progress,
            dependencies,
            inputs: self.input_views(subtask, context),
        }
    }

    /// File references this subtask did not produce, inlined when small.
    fn input_views(&self, subtask: &Subtask, context: &TaskContext) -> Vec<InputView> {
        let mut seen = Vec::<PathBuf>::new();
        let mut views = Vec::new();
        for (name, reference) in &context.file_paths {
            let own_output = reference.metadata.is_output()
                && reference.metadata.created_by.as_deref() == Some(subtask.id.as_str());
            if own_output || seen.contains(&reference.path) {
                continue;
            }
            seen.push(reference.path.clone());

            let size = fs::metadata(&reference.path).map(|m| m.len()).ok();
            let Some(size) = size else {
                debug!(name, path = %reference.path.display(), "input file not on disk");
                continue;
            };
            let (fence, content) = if size as usize > self.inline_file_limit_bytes {
                (String::new(), None)
            } else {
                match context.get_file_content(name) {
                    Some(FileContent::Json(value)) => (
                        "json".to_string(),
                        serde_json::to_string_pretty(&value).ok(),
                    ),
                    Some(FileContent::Text(text)) => (String::new(), Some(text)),
                    None => (String::new(), None),
                }
            };
            views.push(InputView {
                name: name.clone(),
                path: reference.path.display().to_string(),
                fence,
                content,
            });
        }
        views
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        subtask: &Subtask,
        context: &mut TaskContext,
        prompt: &str,
        output: &str,
        result: &ExecutionResult,
        task_status: Option<TaskStatus>,
        conversation: &[Turn],
    ) {
        let result_value = serde_json::to_value(result).unwrap_or(Value::Null);
        let action = if result.success {
            "execution_completed"
        } else {
            "execution_error"
        };
        context.add_execution_record(
            action,
            &result.result.summary,
            meta([
                ("prompt", json!(prompt)),
                ("raw_output", json!(output)),
                ("result", result_value.clone()),
            ]),
        );
        context.update_local(keys::SUCCESS, json!(result.success));
        context.update_local(keys::SUMMARY, json!(result.result.summary));
        context.update_local(keys::RESULT, result_value);
        context.update_local(keys::TASK_STATUS, json!(task_status));
        context.update_local(
            keys::CONVERSATION_HISTORY,
            serde_json::to_value(conversation).unwrap_or(Value::Null),
        );

        for (name, path) in &subtask.output_files {
            let resolved = resolve_path(&self.run_root, path);
            if resolved.exists() {
                context.add_file_reference(
                    &format!("output_{name}"),
                    resolved,
                    FileMetadata::output(&subtask.id, name),
                );
            }
        }

        if let Err(err) = write_interaction(&InteractionWriteRequest {
            root: &self.run_root,
            task_id: &subtask.id,
            prompt,
            output,
            result,
        }) {
            warn!(task = %subtask.id, err = %format!("{err:#}"), "cannot write interaction log");
        }
    }
}

fn meta<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
