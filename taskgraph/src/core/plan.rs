//! The subtask plan as an arena with a scheduling watermark.
//!
//! Entries keep stable ids and positions. An entry leaves `Pending` when it is
//! handed out for execution and only returns when an interrupted run is
//! resumed, so plan adjustments (which only touch `Pending` entries) cannot
//! affect work that has started or finished.
//! The cursor is the position just after the last handed-out entry; new
//! entries are never placed before it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::normalize::normalize_subtasks;
use crate::core::types::Subtask;

/// Fields an adjustment may not overwrite on an existing entry.
const FROZEN_FIELDS: &[&str] = &["id", "insert_index"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Scheduled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub subtask: Subtask,
    pub state: EntryState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    entries: Vec<PlanEntry>,
    revision: u64,
}

/// A planner decision to reshape the remaining plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanAdjustment {
    pub needs_adjustment: bool,
    pub reason: String,
    pub insert_tasks: Vec<Value>,
    pub remove_tasks: Vec<String>,
    pub modify_tasks: Vec<Value>,
}

/// What an applied adjustment actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdjustmentReport {
    pub inserted: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub rejected: Vec<String>,
}

impl AdjustmentReport {
    pub fn changed(&self) -> bool {
        !(self.inserted.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }
}

/// Parse an adjustment decision, optionally wrapped in a `result` object.
///
/// Returns `None` when the value does not carry a boolean `needs_adjustment`.
pub fn parse_adjustment(value: &Value) -> Option<PlanAdjustment> {
    let body = match value.get("result") {
        Some(inner @ Value::Object(_)) if inner.get("needs_adjustment").is_some() => inner,
        _ => value,
    };
    let needs_adjustment = body.get("needs_adjustment")?.as_bool()?;
    let list = |key: &str| -> Vec<Value> {
        body.get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    Some(PlanAdjustment {
        needs_adjustment,
        reason: body
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason given")
            .to_string(),
        insert_tasks: list("insert_tasks"),
        remove_tasks: list("remove_tasks")
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        modify_tasks: list("modify_tasks"),
    })
}

impl Plan {
    pub fn new(subtasks: Vec<Subtask>) -> Self {
        Self {
            entries: subtasks
                .into_iter()
                .map(|subtask| PlanEntry {
                    subtask,
                    state: EntryState::Pending,
                })
                .collect(),
            revision: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn subtasks(&self) -> Vec<Subtask> {
        self.entries.iter().map(|e| e.subtask.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.position(id).map(|i| &self.entries[i].subtask)
    }

    pub fn state(&self, id: &str) -> Option<EntryState> {
        self.position(id).map(|i| self.entries[i].state)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.subtask.id == id)
    }

    /// Position just after the last entry that has left `Pending`.
    pub fn cursor(&self) -> usize {
        self.entries
            .iter()
            .rposition(|e| e.state != EntryState::Pending)
            .map_or(0, |i| i + 1)
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.state != EntryState::Pending)
    }

    /// Subtasks still waiting to be handed out, in plan order.
    pub fn pending(&self) -> Vec<Subtask> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .map(|e| e.subtask.clone())
            .collect()
    }

    pub fn completed_ids(&self) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Completed)
            .map(|e| e.subtask.id.clone())
            .collect()
    }

    /// Hand out the next pending entry in plan order.
    pub fn next_sequential(&mut self) -> Option<Subtask> {
        let start = self.cursor();
        let index = (start..self.entries.len())
            .find(|&i| self.entries[i].state == EntryState::Pending)?;
        self.entries[index].state = EntryState::Scheduled;
        Some(self.entries[index].subtask.clone())
    }

    /// Most recent completed entry before `id` in plan order.
    pub fn preceding_completed(&self, id: &str) -> Option<&Subtask> {
        let index = self.position(id)?;
        self.entries[..index]
            .iter()
            .rev()
            .find(|e| e.state == EntryState::Completed)
            .map(|e| &e.subtask)
    }

    pub fn mark_scheduled(&mut self, id: &str) {
        self.set_state(id, EntryState::Scheduled);
    }

    pub fn mark_completed(&mut self, id: &str) {
        self.set_state(id, EntryState::Completed);
    }

    /// Return entries that were handed out but never completed to `Pending`.
    ///
    /// Used when resuming an interrupted run.
    pub fn requeue_in_flight(&mut self) -> Vec<String> {
        let mut requeued = Vec::new();
        for entry in &mut self.entries {
            if entry.state == EntryState::Scheduled {
                entry.state = EntryState::Pending;
                requeued.push(entry.subtask.id.clone());
            }
        }
        requeued
    }

    fn set_state(&mut self, id: &str, state: EntryState) {
        if let Some(i) = self.position(id) {
            self.entries[i].state = state;
        } else {
            warn!(task = id, ?state, "state change for unknown plan entry");
        }
    }

    /// Apply an adjustment to the pending part of the plan.
    pub fn apply(&mut self, adjustment: &PlanAdjustment) -> AdjustmentReport {
        let mut report = AdjustmentReport::default();
        if !adjustment.needs_adjustment {
            return report;
        }

        for raw in &adjustment.insert_tasks {
            self.insert(raw, &mut report);
        }
        for id in &adjustment.remove_tasks {
            match self.position(id) {
                Some(i) if self.entries[i].state == EntryState::Pending => {
                    self.entries.remove(i);
                    report.removed.push(id.clone());
                }
                Some(_) => report.rejected.push(format!("remove {id}: already handed out")),
                None => report.rejected.push(format!("remove {id}: unknown task")),
            }
        }
        for raw in &adjustment.modify_tasks {
            self.modify(raw, &mut report);
        }

        if report.changed() {
            self.revision += 1;
            debug!(revision = self.revision, ?report, "plan adjusted");
        }
        report
    }

    fn insert(&mut self, raw: &Value, report: &mut AdjustmentReport) {
        let Some(obj) = raw.as_object() else {
            report.rejected.push("insert: task is not an object".to_string());
            return;
        };
        let mut obj = obj.clone();
        let requested = obj
            .remove("insert_index")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize);
        if obj.get("id").and_then(Value::as_str).is_none() {
            obj.insert("id".to_string(), Value::String(self.fresh_id()));
        }
        let Some(subtask) = normalize_subtasks(&[Value::Object(obj)]).pop() else {
            return;
        };
        if self.position(&subtask.id).is_some() {
            report
                .rejected
                .push(format!("insert {}: id already in plan", subtask.id));
            return;
        }

        let cursor = self.cursor();
        let index = requested
            .unwrap_or(cursor)
            .clamp(cursor, self.entries.len());
        report.inserted.push(subtask.id.clone());
        self.entries.insert(
            index,
            PlanEntry {
                subtask,
                state: EntryState::Pending,
            },
        );
    }

    fn modify(&mut self, raw: &Value, report: &mut AdjustmentReport) {
        let Some(id) = raw.get("id").and_then(Value::as_str) else {
            report.rejected.push("modify: missing id".to_string());
            return;
        };
        let Some(index) = self.position(id) else {
            report.rejected.push(format!("modify {id}: unknown task"));
            return;
        };
        if self.entries[index].state != EntryState::Pending {
            report
                .rejected
                .push(format!("modify {id}: already handed out"));
            return;
        }

        let Ok(Value::Object(mut merged)) = serde_json::to_value(&self.entries[index].subtask)
        else {
            return;
        };
        let changes: Map<String, Value> = raw.as_object().cloned().unwrap_or_default();
        for (key, value) in changes {
            if !FROZEN_FIELDS.contains(&key.as_str()) {
                merged.insert(key, value);
            }
        }
        if let Some(mut updated) = normalize_subtasks(&[Value::Object(merged)]).pop() {
            updated.id = id.to_string();
            self.entries[index].subtask = updated;
            report.modified.push(id.to_string());
        }
    }

    fn fresh_id(&self) -> String {
        (self.entries.len() + 1..)
            .map(|n| format!("task_{n}"))
            .find(|candidate| self.position(candidate).is_none())
            .unwrap_or_else(|| format!("task_{}", self.entries.len() + 1))
    }
}
