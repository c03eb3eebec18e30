//! Dependency graph analysis: batching and critical path.
//!
//! Batches are computed by repeatedly collecting the subtasks whose
//! dependencies all lie in strictly earlier batches. Within a batch, subtasks
//! keep their plan order so scheduling is deterministic.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::warn;

use crate::core::types::Subtask;

/// Non-fatal problems found while scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleDiagnostic {
    /// A dependency names a subtask that is not in the plan; it is ignored.
    UnknownDependency { task: String, dependency: String },
    /// The listed subtasks could not be ordered and were placed in one final batch.
    Cycle { tasks: Vec<String> },
}

/// Ordered batches of subtask ids plus any diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub batches: Vec<Vec<String>>,
    pub diagnostics: Vec<ScheduleDiagnostic>,
}

impl Schedule {
    pub fn has_cycle(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| matches!(d, ScheduleDiagnostic::Cycle { .. }))
    }
}

/// Partition subtasks into dependency-ordered batches.
pub fn schedule(subtasks: &[Subtask]) -> Schedule {
    schedule_remaining(subtasks, &HashSet::new())
}

/// Partition subtasks into batches, treating dependencies on `satisfied` ids
/// (already-completed work) as resolved.
pub fn schedule_remaining(subtasks: &[Subtask], satisfied: &HashSet<String>) -> Schedule {
    let known: HashSet<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
    let mut diagnostics = Vec::new();

    // Dependencies that actually constrain ordering within this set.
    let mut pending_deps: Vec<(&Subtask, Vec<&str>)> = Vec::with_capacity(subtasks.len());
    for subtask in subtasks {
        let mut deps = Vec::new();
        for dep in &subtask.dependencies {
            if known.contains(dep.as_str()) {
                deps.push(dep.as_str());
            } else if !satisfied.contains(dep) {
                warn!(task = %subtask.id, dependency = %dep, "ignoring unknown dependency");
                diagnostics.push(ScheduleDiagnostic::UnknownDependency {
                    task: subtask.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        pending_deps.push((subtask, deps));
    }

    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut batches = Vec::new();

    while scheduled.len() < subtasks.len() {
        let batch: Vec<&str> = pending_deps
            .iter()
            .filter(|(subtask, _)| !scheduled.contains(subtask.id.as_str()))
            .filter(|(_, deps)| deps.iter().all(|dep| scheduled.contains(dep)))
            .map(|(subtask, _)| subtask.id.as_str())
            .collect();

        if batch.is_empty() {
            let remaining: Vec<String> = subtasks
                .iter()
                .filter(|s| !scheduled.contains(s.id.as_str()))
                .map(|s| s.id.clone())
                .collect();
            warn!(tasks = ?remaining, "dependency cycle detected; scheduling remaining tasks together");
            diagnostics.push(ScheduleDiagnostic::Cycle {
                tasks: remaining.clone(),
            });
            batches.push(remaining);
            break;
        }

        scheduled.extend(batch.iter().copied());
        batches.push(batch.into_iter().map(str::to_string).collect());
    }

    Schedule {
        batches,
        diagnostics,
    }
}

/// Longest dependency chain through the plan, from root to leaf.
///
/// Subtasks caught in a cycle are excluded.
pub fn critical_path(subtasks: &[Subtask]) -> Vec<String> {
    let plan = schedule(subtasks);
    let cyclic: HashSet<&str> = plan
        .diagnostics
        .iter()
        .filter_map(|d| match d {
            ScheduleDiagnostic::Cycle { tasks } => Some(tasks),
            ScheduleDiagnostic::UnknownDependency { .. } => None,
        })
        .flatten()
        .map(String::as_str)
        .collect();
    let by_id: HashMap<&str, &Subtask> = subtasks.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut length: HashMap<&str, usize> = HashMap::new();
    let mut previous: HashMap<&str, &str> = HashMap::new();
    let mut order = Vec::new();
    for id in plan.batches.iter().flatten() {
        let id = id.as_str();
        if cyclic.contains(id) {
            continue;
        }
        let Some(subtask) = by_id.get(id) else {
            continue;
        };
        let mut best = 0usize;
        for dep in &subtask.dependencies {
            if let Some((&dep_id, &dep_len)) = length.get_key_value(dep.as_str())
                && dep_len > best
            {
                best = dep_len;
                previous.insert(id, dep_id);
            }
        }
        length.insert(id, best + 1);
        order.push(id);
    }

    let mut tail = None;
    for id in &order {
        let len = length[id];
        if tail.is_none_or(|(_, best)| len > best) {
            tail = Some((*id, len));
        }
    }

    let mut path = Vec::new();
    let mut cursor = tail.map(|(id, _)| id);
    while let Some(id) = cursor {
        path.push(id.to_string());
        cursor = previous.get(id).copied();
    }
    path.reverse();
    path
}
