//! Side-effecting pieces: filesystem, child processes, engine calls.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

pub mod artifacts;
pub mod config;
pub mod context;
pub mod engine;
pub mod interaction_log;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod run_state;

/// Atomically replace `path` with `contents` (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Serialize `value` to pretty JSON with a trailing newline and write it atomically.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Current UTC time as RFC 3339, used for every persisted timestamp.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
