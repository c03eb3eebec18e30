//! Plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::validate_plan;
use crate::core::plan::Plan;
use crate::io::write_json_atomic;

pub const PLAN_FILE: &str = "plan.json";

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

/// Load and validate a plan snapshot (schema + invariants).
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", path.display()))?;
    validate_schema(&value)?;
    let plan: Plan = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", path.display()))?;
    let errors = validate_plan(&plan.subtasks());
    if !errors.is_empty() {
        return Err(anyhow!("plan invariants failed: {}", errors.join("; ")));
    }
    debug!(entries = plan.len(), revision = plan.revision(), "plan loaded");
    Ok(plan)
}

/// Atomically write a plan snapshot.
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    write_json_atomic(path, plan)
}

/// Validate JSON against the embedded plan schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("invalid plan schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
