//! Test-only helpers: subtask builders and a scripted reasoning engine.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::core::normalize::default_main_result_path;
use crate::core::types::{MAIN_RESULT, Subtask};
use crate::io::engine::{EngineError, EngineRequest, EngineResponse, ReasoningEngine};

type Responder = Box<dyn Fn(&EngineRequest) -> Result<EngineResponse, EngineError> + Send + Sync>;

/// Create a deterministic subtask with a default `main_result` output and no dependencies.
pub fn subtask(id: &str) -> Subtask {
    Subtask {
        id: id.to_string(),
        name: format!("{id} name"),
        description: String::new(),
        instruction: format!("Do {id}"),
        dependencies: Vec::new(),
        input_files: BTreeMap::new(),
        output_files: BTreeMap::from([(MAIN_RESULT.to_string(), default_main_result_path(id))]),
        success_criteria: Vec::new(),
        timeout_secs: None,
    }
}

pub fn subtask_with_deps(id: &str, deps: &[&str]) -> Subtask {
    Subtask {
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        ..subtask(id)
    }
}

/// Engine output that writes `main_result` through a file block and reports success.
pub fn success_output(task_id: &str, summary: &str) -> String {
    format!(
        "Finished.\n\n```json file: main_result\n{{\"task\": \"{task_id}\"}}\n```\n\n```json\n{{\"task_id\": \"{task_id}\", \"success\": true, \"result\": {{\"summary\": \"{summary}\", \"details\": \"\"}}}}\n```\nTASK_STATUS: COMPLETED\n"
    )
}

/// Engine output that reports failure without writing any file.
pub fn failure_output(task_id: &str, error: &str) -> String {
    format!(
        "```json\n{{\"task_id\": \"{task_id}\", \"success\": false, \"error\": \"{error}\", \"result\": {{\"summary\": \"{error}\"}}}}\n```\nTASK_STATUS: COMPLETED\n"
    )
}

/// Subtask id named in an executor prompt (`Id: <id>` line).
pub fn prompt_task_id(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("Id: "))
        .map(str::trim)
}

/// Engine returning canned responses in order, then deferring to an optional responder.
///
/// Every request is recorded.
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<EngineResponse, EngineError>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Result<EngineResponse, EngineError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            responder: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Engine that answers every request with `responder`.
    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&EngineRequest) -> Result<EngineResponse, EngineError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new(Vec::new())
        }
    }

    /// Engine that is never reachable.
    pub fn unavailable() -> Self {
        Self::responding(|_| Err(EngineError::Invocation("engine unavailable".to_string())))
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

impl ReasoningEngine for ScriptedEngine {
    fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(next) = self.script.lock().expect("script lock").pop_front() {
            return next;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Err(EngineError::Invocation("script exhausted".to_string())),
        }
    }
}
