//! Prompt rendering for planner and executor engine calls.
//!
//! Templates are split into marked sections (`<!-- section:KEY required|droppable -->`)
//! so a rendered prompt can be trimmed to a byte budget by dropping the least
//! important sections first.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::Subtask;

const EXECUTOR_TEMPLATE: &str = include_str!("prompts/executor.md");
const ANALYSIS_TEMPLATE: &str = include_str!("prompts/analysis.md");
const BREAKDOWN_TEMPLATE: &str = include_str!("prompts/breakdown.md");
const ADJUSTMENT_TEMPLATE: &str = include_str!("prompts/adjustment.md");
const INTEGRATION_TEMPLATE: &str = include_str!("prompts/integration.md");

/// Instruction appended when the engine reports unfinished work.
pub const CONTINUATION_PROMPT: &str = "Continue the subtask from where you stopped. Do not repeat finished work. \
When done, finish with the fenced json result block and `TASK_STATUS: COMPLETED`, \
or `TASK_STATUS: CONTINUE` if more work still remains.";

/// Droppable sections, least important first.
const DROP_ORDER: &[&str] = &["inputs", "dependencies", "progress", "analysis", "completed"];

const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template("executor", EXECUTOR_TEMPLATE)?;
        env.add_template("analysis", ANALYSIS_TEMPLATE)?;
        env.add_template("breakdown", BREAKDOWN_TEMPLATE)?;
        env.add_template("adjustment", ADJUSTMENT_TEMPLATE)?;
        env.add_template("integration", INTEGRATION_TEMPLATE)?;
        Ok(Self { env })
    }

    /// The process-wide engine; templates are registered on first use.
    fn shared() -> Result<&'static Self> {
        static ENGINE: LazyLock<Result<PromptEngine, String>> =
            LazyLock::new(|| PromptEngine::new().map_err(|err| format!("{err:#}")));
        ENGINE
            .as_ref()
            .map_err(|err| anyhow!("register prompt templates: {err}"))
    }

    fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let template = self.env.get_template(name)?;
        Ok(template.render(ctx)?)
    }
}

/// A declared output with its absolute path.
#[derive(Debug, Clone, Serialize)]
pub struct OutputView {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressView {
    /// 1-based position of the subtask in the plan.
    pub current_index: usize,
    pub total_tasks: usize,
    pub completed_tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyView {
    pub task_id: String,
    pub success: bool,
    pub summary: String,
    /// Present only when short enough to inline.
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputView {
    pub name: String,
    pub path: String,
    /// Fence language: `json` for JSON content, empty otherwise.
    pub fence: String,
    /// `None` when the file is too large to inline.
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EnvironmentView {
    workdir: String,
    task_dir: String,
}

/// Everything the executor prompt embeds.
#[derive(Debug, Clone)]
pub struct ExecutorPromptInputs<'a> {
    pub subtask: &'a Subtask,
    pub workdir: String,
    pub task_dir: String,
    pub outputs: Vec<OutputView>,
    pub progress: Option<ProgressView>,
    pub dependencies: Vec<DependencyView>,
    pub inputs: Vec<InputView>,
}

/// One line of per-subtask status in planner prompts.
#[derive(Debug, Clone, Serialize)]
pub struct ResultLine {
    pub task_id: String,
    pub success: bool,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct AdjustmentPromptInputs<'a> {
    pub task_description: &'a str,
    pub failed_task: &'a str,
    /// Pretty JSON describing the failure.
    pub failure: String,
    pub completed: Vec<ResultLine>,
    /// Pretty JSON of the subtasks that have not started.
    pub remaining: String,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output at section markers; empty droppable sections vanish.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(String, bool, usize, usize)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((key, required, whole.start(), whole.end()))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, content_start)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(_, _, next_start, _)| *next_start);
        let content = rendered[*content_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in [`DROP_ORDER`] until under budget, then truncate the last one.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let other_len: usize = rest.iter().map(|s| s.content.len()).sum();
    let allowed = budget.saturating_sub(other_len);
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATION_MARKER.len());
        last.content.push_str(TRUNCATION_MARKER);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_executor(&self, input: &ExecutorPromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::shared()?.render(
            "executor",
            context! {
                task => input.subtask,
                outputs => &input.outputs,
                environment => EnvironmentView {
                    workdir: input.workdir.clone(),
                    task_dir: input.task_dir.clone(),
                },
                progress => &input.progress,
                dependencies => &input.dependencies,
                inputs => &input.inputs,
            },
        )?;
        Ok(self.fit(&rendered))
    }

    pub fn build_analysis(&self, task_description: &str) -> Result<String> {
        let rendered = PromptEngine::shared()?.render(
            "analysis",
            context! { task_description => task_description.trim() },
        )?;
        Ok(self.fit(&rendered))
    }

    pub fn build_breakdown(&self, task_description: &str, analysis: &str) -> Result<String> {
        let rendered = PromptEngine::shared()?.render(
            "breakdown",
            context! {
                task_description => task_description.trim(),
                analysis => (!analysis.trim().is_empty()).then(|| analysis.trim()),
            },
        )?;
        Ok(self.fit(&rendered))
    }

    pub fn build_adjustment(&self, input: &AdjustmentPromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::shared()?.render(
            "adjustment",
            context! {
                task_description => input.task_description.trim(),
                failed_task => input.failed_task,
                failure => &input.failure,
                completed => &input.completed,
                remaining => &input.remaining,
            },
        )?;
        Ok(self.fit(&rendered))
    }

    pub fn build_integration(&self, task_description: &str, results: &[ResultLine]) -> Result<String> {
        let rendered = PromptEngine::shared()?.render(
            "integration",
            context! {
                task_description => task_description.trim(),
                results => results,
            },
        )?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        let mut prompt = render_sections(&sections);
        if prompt.len() > self.budget_bytes {
            warn!(
                bytes = prompt.len(),
                budget = self.budget_bytes,
                "required prompt sections exceed budget; clamping"
            );
            truncate_at_char_boundary(&mut prompt, self.budget_bytes);
        }
        prompt
    }
}
