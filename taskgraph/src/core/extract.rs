//! Turning free-form engine text into structured results.
//!
//! Every engine response passes through the same pipeline: a structured JSON
//! result when the text carries one, otherwise a heuristic reading of the
//! prose. Both shapes end in [`normalize_result`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::{ExecutionResult, ResultBody};

const SUMMARY_LIMIT: usize = 200;
const DETAILS_LIMIT: usize = 2000;
const DEFAULT_SUMMARY: &str = "Task execution completed";

const SUCCESS_WORDS: &[&str] = &["success", "done", "completed"];
const FAILURE_WORDS: &[&str] = &["error", "fail", "failed", "failure"];

static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[ \t]*\r?\n?(.*?)```").expect("json fence regex"));
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^```([^\n`]*)\r?\n(.*?)^```[ \t]*$").expect("fence regex")
});
static FILE_INFO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[\w+.-]+[ \t]+)?file:[ \t]*(\S+)[ \t]*$").expect("file info regex")
});

/// Result of reading engine text.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// The last parseable fenced JSON block.
    Structured(Value),
    /// Keyword and layout based reading of prose.
    Heuristic(HeuristicResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicResult {
    pub success: bool,
    pub summary: String,
    pub details: String,
    pub artifacts: BTreeMap<String, String>,
}

/// A fenced block whose info string names a destination file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub name: String,
    pub content: String,
}

/// Read engine text as either a structured or heuristic result.
pub fn extract(text: &str) -> Extraction {
    match last_fenced_json(text) {
        Some(value @ Value::Object(_)) => Extraction::Structured(value),
        _ => Extraction::Heuristic(heuristic(text)),
    }
}

/// Last ```` ```json ```` block that parses; unparseable blocks are skipped.
pub fn last_fenced_json(text: &str) -> Option<Value> {
    JSON_FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| serde_json::from_str::<Value>(caps[1].trim()).ok())
        .last()
}

/// Best-effort JSON recovery for planner responses.
///
/// Tries the last fenced JSON block, then the whole text, then the outermost
/// brace-delimited span.
pub fn find_json(text: &str) -> Option<Value> {
    if let Some(value) = last_fenced_json(text) {
        return Some(value);
    }
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Fenced blocks whose info string ends in `file: <name>`.
pub fn file_blocks(text: &str) -> Vec<FileBlock> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let info = caps[1].trim();
            let name = FILE_INFO_RE.captures(info)?.get(1)?.as_str().to_string();
            Some(FileBlock {
                name,
                content: caps[2].trim_end_matches(['\r', '\n']).to_string(),
            })
        })
        .collect()
}

/// Heuristic reading of unstructured text.
pub fn heuristic(text: &str) -> HeuristicResult {
    if text.trim().is_empty() {
        return HeuristicResult {
            success: false,
            summary: "Task execution failed: no engine output".to_string(),
            details: "The engine returned no output".to_string(),
            artifacts: BTreeMap::new(),
        };
    }

    let lowered = text.to_lowercase();
    let has_success = SUCCESS_WORDS.iter().any(|word| lowered.contains(word));
    let has_failure = FAILURE_WORDS.iter().any(|word| lowered.contains(word));

    HeuristicResult {
        success: has_success || !has_failure,
        summary: summarize(text),
        details: truncate_with_ellipsis(text, DETAILS_LIMIT),
        artifacts: code_artifacts(text),
    }
}

/// Normalize an extraction into a complete [`ExecutionResult`].
pub fn normalize_result(task_id: &str, extraction: Extraction) -> ExecutionResult {
    let mut result = match extraction {
        Extraction::Structured(value) => from_structured(task_id, &value),
        Extraction::Heuristic(h) => ExecutionResult {
            task_id: task_id.to_string(),
            success: h.success,
            result: ResultBody {
                summary: h.summary,
                details: h.details,
            },
            artifacts: h.artifacts,
            next_steps: None,
            error: None,
        },
    };
    if !result.success && result.error.as_deref().is_none_or(str::is_empty) {
        result.error = Some(result.result.summary.clone());
    }
    result
}

fn from_structured(task_id: &str, value: &Value) -> ExecutionResult {
    let empty = serde_json::Map::new();
    let body = match value.get("result") {
        Some(Value::Object(inner)) => inner,
        _ => value.as_object().unwrap_or(&empty),
    };
    let summary = body
        .get("summary")
        .map(value_to_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SUMMARY.to_string());
    let details = body.get("details").map(value_to_text).unwrap_or_default();

    let artifacts = match value.get("artifacts") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_text(v)))
            .collect(),
        _ => BTreeMap::new(),
    };
    let next_steps = match value.get("next_steps") {
        Some(Value::Array(items)) => Some(items.iter().map(value_to_text).collect()),
        _ => None,
    };
    let error = value
        .get("error")
        .map(value_to_text)
        .filter(|s| !s.is_empty());

    ExecutionResult {
        task_id: task_id.to_string(),
        success: value
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        result: ResultBody { summary, details },
        artifacts,
        next_steps,
        error,
    }
}

fn summarize(text: &str) -> String {
    let mut lines = Vec::new();
    let mut total = 0usize;
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || trimmed.is_empty() {
            continue;
        }
        lines.push(trimmed);
        total += trimmed.chars().count();
        if total >= SUMMARY_LIMIT {
            break;
        }
    }
    let summary = lines.join(" ");
    if summary.chars().count() > SUMMARY_LIMIT {
        let cut: String = summary.chars().take(SUMMARY_LIMIT - 3).collect();
        format!("{cut}...")
    } else {
        summary
    }
}

fn truncate_with_ellipsis(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}...")
}

fn code_artifacts(text: &str) -> BTreeMap<String, String> {
    FENCE_RE
        .captures_iter(text)
        .enumerate()
        .map(|(i, caps)| {
            let lang = caps[1].split_whitespace().next().unwrap_or_default();
            let name = if lang.is_empty() {
                format!("code_block_{}", i + 1)
            } else {
                format!("{lang}_code_{}", i + 1)
            };
            (name, caps[2].trim().to_string())
        })
        .collect()
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
