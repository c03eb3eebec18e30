//! Per-subtask interaction logs under `<run_root>/interactions/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::ExecutionResult;
use crate::io::write_json_atomic;

#[derive(Debug, Clone)]
pub struct InteractionPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
    pub result_path: PathBuf,
    pub error_log_path: PathBuf,
}

impl InteractionPaths {
    pub fn new(root: &Path, task_id: &str) -> Self {
        let dir = root.join("interactions").join(task_id);
        Self {
            prompt_path: dir.join("prompt.md"),
            output_path: dir.join("output.txt"),
            result_path: dir.join("result.json"),
            error_log_path: root.join("logs").join(format!("error_{task_id}.log")),
            dir,
        }
    }
}

pub struct InteractionWriteRequest<'a> {
    pub root: &'a Path,
    pub task_id: &'a str,
    pub prompt: &'a str,
    pub output: &'a str,
    pub result: &'a ExecutionResult,
}

/// Write prompt, raw output and result; failed results also get an error log.
pub fn write_interaction(request: &InteractionWriteRequest<'_>) -> Result<InteractionPaths> {
    let paths = InteractionPaths::new(request.root, request.task_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create interaction dir {}", paths.dir.display()))?;

    write_text(&paths.prompt_path, request.prompt)?;
    write_text(&paths.output_path, request.output)?;
    write_json_atomic(&paths.result_path, request.result)?;

    if !request.result.success {
        let log = format!(
            "task: {}\nerror: {}\nsummary: {}\n\n--- output ---\n{}\n",
            request.task_id,
            request.result.error.as_deref().unwrap_or("unknown"),
            request.result.result.summary,
            request.output
        );
        if let Some(parent) = paths.error_log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        write_text(&paths.error_log_path, &log)?;
    }
    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = InteractionPaths::new(temp.path(), "task_1");

        assert!(paths.dir.ends_with(Path::new("interactions/task_1")));
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(paths.output_path.ends_with("output.txt"));
        assert!(paths.result_path.ends_with("result.json"));
        assert!(paths.error_log_path.ends_with(Path::new("logs/error_task_1.log")));
    }

    #[test]
    fn failed_interaction_writes_error_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = ExecutionResult::failure("task_1", "timeout", "");

        let paths = write_interaction(&InteractionWriteRequest {
            root: temp.path(),
            task_id: "task_1",
            prompt: "do the thing",
            output: "",
            result: &result,
        })
        .expect("write logs");

        assert!(paths.prompt_path.is_file());
        assert!(paths.output_path.is_file());
        assert!(paths.result_path.is_file());
        let log = fs::read_to_string(&paths.error_log_path).expect("error log");
        assert!(log.contains("error: timeout"));
    }
}
