//! Reasoning-engine boundary.
//!
//! The [`ReasoningEngine`] trait decouples planning and execution from the
//! actual backend (by default a CLI such as `claude -p`). Tests use scripted
//! engines that return canned responses without spawning processes.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::TaskStatus;
use crate::io::process::run_command_with_timeout;

static TASK_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*TASK_STATUS:\s*(COMPLETED|CONTINUE|NEEDS_VERIFICATION)\s*$")
        .expect("task status regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Engine,
}

/// One earlier exchange carried into a continuation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Parameters for an engine invocation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub prompt: String,
    /// Hard deadline for this call.
    pub timeout: Duration,
    /// Earlier turns of the same conversation, oldest first.
    pub conversation: Vec<Turn>,
}

impl EngineRequest {
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            timeout,
            conversation: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub status: EngineStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
}

impl EngineResponse {
    pub fn success(output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            task_status: parse_task_status(&output),
            status: EngineStatus::Success,
            output,
            error_msg: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: EngineStatus::Error,
            output: String::new(),
            error_msg: Some(message.into()),
            task_status: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EngineStatus::Success
    }
}

/// Failures raised by an engine call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The call exceeded its deadline. Not retried.
    #[error("engine call timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    /// The call could not be made or broke mid-way. Retried with backoff.
    #[error("engine invocation failed: {0}")]
    Invocation(String),
}

/// Abstraction over reasoning-engine backends.
///
/// Implementations are shared across scheduler workers.
pub trait ReasoningEngine: Send + Sync {
    fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError>;
}

impl<E: ReasoningEngine + ?Sized> ReasoningEngine for &E {
    fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        (**self).invoke(request)
    }
}

/// Last `TASK_STATUS: <STATUS>` marker line in engine output.
pub fn parse_task_status(output: &str) -> Option<TaskStatus> {
    TASK_STATUS_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| TaskStatus::parse(&caps[1]))
}

/// Engine that spawns a configured command and talks to it over stdin/stdout.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    command: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
}

impl CommandEngine {
    pub fn new(command: Vec<String>, workdir: PathBuf, output_limit_bytes: usize) -> Self {
        Self {
            command,
            workdir,
            output_limit_bytes,
        }
    }
}

impl ReasoningEngine for CommandEngine {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), turns = request.conversation.len()))]
    fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        info!(workdir = %self.workdir.display(), "invoking engine command");
        let input = render_conversation(request);
        let output = run_command_with_timeout(
            &self.command,
            &self.workdir,
            Some(input.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| EngineError::Invocation(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "engine timed out");
            return Err(EngineError::Timeout {
                timeout: request.timeout,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "engine command failed");
            let stderr = output.stderr_text();
            return Ok(EngineResponse {
                status: EngineStatus::Error,
                output: output.stdout_text(),
                error_msg: Some(if stderr.is_empty() {
                    format!("engine exited with status {:?}", output.status.code())
                } else {
                    stderr
                }),
                task_status: None,
            });
        }

        debug!(bytes = output.stdout.len(), "engine call completed");
        Ok(EngineResponse::success(output.stdout_text()))
    }
}

/// Flatten earlier turns and the new prompt into one stdin payload.
fn render_conversation(request: &EngineRequest) -> String {
    if request.conversation.is_empty() {
        return request.prompt.clone();
    }
    let mut buf = String::from("<conversation>\n");
    for turn in &request.conversation {
        let tag = match turn.role {
            Role::User => "user",
            Role::Engine => "assistant",
        };
        buf.push_str(&format!("<{tag}>\n{}\n</{tag}>\n", turn.content.trim()));
    }
    buf.push_str("</conversation>\n\n");
    buf.push_str(&request.prompt);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_task_status_marker_wins() {
        let output = "TASK_STATUS: CONTINUE\nmore work\nTASK_STATUS: COMPLETED\n";
        assert_eq!(parse_task_status(output), Some(TaskStatus::Completed));
        assert_eq!(parse_task_status("no marker"), None);
    }

    #[test]
    fn conversation_is_rendered_before_prompt() {
        let mut request = EngineRequest::new("continue", Duration::from_secs(1));
        request.conversation = vec![
            Turn {
                role: Role::User,
                content: "do it".to_string(),
            },
            Turn {
                role: Role::Engine,
                content: "half done".to_string(),
            },
        ];
        let rendered = render_conversation(&request);
        let user = rendered.find("<user>\ndo it").expect("user turn");
        let engine = rendered.find("<assistant>\nhalf done").expect("engine turn");
        assert!(user < engine);
        assert!(rendered.ends_with("continue"));
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_reads_stdout_and_status_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = CommandEngine::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo done; echo 'TASK_STATUS: CONTINUE'".to_string(),
            ],
            temp.path().to_path_buf(),
            10_000,
        );
        let response = engine
            .invoke(&EngineRequest::new("prompt", Duration::from_secs(5)))
            .expect("invoke");

        assert!(response.is_success());
        assert!(response.output.contains("done"));
        assert_eq!(response.task_status, Some(TaskStatus::Continue));
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_maps_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let failing = CommandEngine::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo boom >&2; exit 3".to_string(),
            ],
            temp.path().to_path_buf(),
            10_000,
        );
        let response = failing
            .invoke(&EngineRequest::new("prompt", Duration::from_secs(5)))
            .expect("invoke");
        assert_eq!(response.status, EngineStatus::Error);
        assert_eq!(response.error_msg.as_deref(), Some("boom"));

        let slow = CommandEngine::new(
            vec!["sleep".to_string(), "5".to_string()],
            temp.path().to_path_buf(),
            10_000,
        );
        let err = slow
            .invoke(&EngineRequest::new("prompt", Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }
}
