//! Normalization of engine-produced subtask lists.
//!
//! Decomposition output is loosely shaped JSON. Normalization fills defaults so
//! every downstream component can rely on complete [`Subtask`] records, and is
//! idempotent: normalizing an already-normalized list changes nothing.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::core::types::{MAIN_RESULT, Subtask};

/// Id used when decomposition fails and the whole task runs as one subtask.
pub const FALLBACK_TASK_ID: &str = "fallback_task";

/// Default location of a subtask's primary result file, relative to the run root.
pub fn default_main_result_path(task_id: &str) -> String {
    format!("results/{task_id}/result.json")
}

/// Normalize raw subtask definitions, in order.
pub fn normalize_subtasks(raw: &[Value]) -> Vec<Subtask> {
    let mut seen = HashSet::new();
    raw.iter()
        .enumerate()
        .map(|(index, value)| {
            let mut subtask = normalize_one(index, value);
            subtask.id = unique_id(&subtask.id, &seen);
            seen.insert(subtask.id.clone());
            subtask
                .output_files
                .entry(MAIN_RESULT.to_string())
                .or_insert_with(|| default_main_result_path(&subtask.id));
            subtask
        })
        .collect()
}

/// Re-run normalization over typed subtasks (e.g. a predefined plan file).
pub fn renormalize(subtasks: &[Subtask]) -> Vec<Subtask> {
    let raw: Vec<Value> = subtasks
        .iter()
        .filter_map(|subtask| serde_json::to_value(subtask).ok())
        .collect();
    normalize_subtasks(&raw)
}

/// Single-subtask plan covering the whole task.
pub fn fallback_subtask(task_description: &str) -> Subtask {
    let id = FALLBACK_TASK_ID.to_string();
    let mut output_files = BTreeMap::new();
    output_files.insert(MAIN_RESULT.to_string(), default_main_result_path(&id));
    output_files.insert("report".to_string(), format!("results/{id}/report.md"));
    Subtask {
        name: "Complete task".to_string(),
        description: "Execute the complete task as a single unit".to_string(),
        instruction: task_description.to_string(),
        dependencies: Vec::new(),
        input_files: BTreeMap::new(),
        output_files,
        success_criteria: vec!["The task is completed and all outputs are written".to_string()],
        timeout_secs: None,
        id,
    }
}

fn normalize_one(index: usize, value: &Value) -> Subtask {
    let ordinal = index + 1;
    let empty = Map::new();
    let (obj, bare_instruction) = match value {
        Value::Object(obj) => (obj, None),
        Value::String(text) => (&empty, Some(text.trim().to_string())),
        _ => (&empty, None),
    };

    let id = scalar_string(obj.get("id")).unwrap_or_else(|| format!("task_{ordinal}"));
    let name = scalar_string(obj.get("name")).unwrap_or_else(|| format!("Task {ordinal}"));
    let description = scalar_string(obj.get("description")).unwrap_or_default();
    let instruction = scalar_string(obj.get("instruction"))
        .or(bare_instruction.filter(|text| !text.is_empty()))
        .or_else(|| (!description.is_empty()).then(|| description.clone()))
        .unwrap_or_else(|| format!("Execute task {ordinal}"));

    let mut dependencies = Vec::new();
    for dep in string_list(obj.get("dependencies")) {
        if !dependencies.contains(&dep) {
            dependencies.push(dep);
        }
    }

    Subtask {
        id,
        name,
        description,
        instruction,
        dependencies,
        input_files: string_map(obj.get("input_files")),
        output_files: string_map(obj.get("output_files")),
        success_criteria: string_list(obj.get("success_criteria")),
        timeout_secs: obj
            .get("timeout_secs")
            .or_else(|| obj.get("timeout"))
            .and_then(Value::as_u64)
            .filter(|secs| *secs > 0),
    }
}

fn unique_id(candidate: &str, seen: &HashSet<String>) -> String {
    if !seen.contains(candidate) {
        return candidate.to_string();
    }
    (2..)
        .map(|k| format!("{candidate}_{k}"))
        .find(|id| !seen.contains(id))
        .unwrap_or_else(|| candidate.to_string())
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| scalar_string(Some(item)))
            .collect(),
        Some(other) => scalar_string(Some(other)).into_iter().collect(),
        None => Vec::new(),
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(obj)) = value else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter_map(|(key, value)| scalar_string(Some(value)).map(|v| (key.clone(), v)))
        .collect()
}
