//! Writing engine-embedded files and verifying declared outputs.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::extract::FileBlock;
use crate::core::types::Subtask;

/// Resolve `path` against the run root; absolute paths are kept as-is.
pub fn resolve_path(root: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Create the parent directory of every declared output.
pub fn ensure_output_dirs(root: &Path, subtask: &Subtask) -> Result<()> {
    for path in subtask.output_files.values() {
        if let Some(parent) = resolve_path(root, path).parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Where a `file: <name>` block lands for this subtask.
///
/// A declared output key wins, then a declared output whose file name equals
/// `<name>`, then `<name>` under `base_dir`.
pub fn destination_for(root: &Path, subtask: &Subtask, base_dir: &Path, name: &str) -> Result<PathBuf> {
    if let Some(path) = subtask.output_files.get(name) {
        return Ok(resolve_path(root, path));
    }
    let by_file_name = subtask.output_files.values().find(|path| {
        Path::new(path)
            .file_name()
            .is_some_and(|file_name| file_name == name)
    });
    if let Some(path) = by_file_name {
        return Ok(resolve_path(root, path));
    }
    let relative = Path::new(name);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        bail!("file block name escapes the task directory: {name}");
    }
    Ok(resolve_path(root, base_dir).join(relative))
}

/// Write file blocks to disk, returning `(block name, written path)` pairs.
///
/// Blocks that cannot be placed are skipped with a warning.
pub fn write_file_blocks(
    root: &Path,
    subtask: &Subtask,
    base_dir: &Path,
    blocks: &[FileBlock],
) -> Vec<(String, PathBuf)> {
    let mut written = Vec::new();
    for block in blocks {
        let target = match destination_for(root, subtask, base_dir, &block.name) {
            Ok(target) => target,
            Err(err) => {
                warn!(task = %subtask.id, name = %block.name, err = %err, "skipping file block");
                continue;
            }
        };
        if let Err(err) = write_file(&target, &block.content) {
            warn!(task = %subtask.id, path = %target.display(), err = %format!("{err:#}"), "cannot write file block");
            continue;
        }
        debug!(task = %subtask.id, path = %target.display(), bytes = block.content.len(), "wrote file block");
        written.push((block.name.clone(), target));
    }
    written
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("write {}", path.display()))
}

/// Declared outputs that are missing on disk, as `(name, resolved path)`.
pub fn missing_outputs(root: &Path, subtask: &Subtask) -> Vec<(String, PathBuf)> {
    subtask
        .output_files
        .iter()
        .map(|(name, path)| (name.clone(), resolve_path(root, path)))
        .filter(|(_, path)| !path.is_file())
        .collect()
}

/// Files under `dir`, as `(path relative to dir, absolute path)`, in a stable order.
pub fn list_files(dir: &Path) -> Vec<(String, PathBuf)> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(dir = %dir.display(), err = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(dir).ok()?;
            let rel = rel.to_string_lossy().replace('\\', "/");
            Some((rel, entry.path().to_path_buf()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::subtask;

    fn block(name: &str, content: &str) -> FileBlock {
        FileBlock {
            name: name.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn file_blocks_land_on_declared_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut task = subtask("report");
        task.output_files
            .insert("summary".to_string(), "out/summary.md".to_string());
        let base = Path::new("results/report");

        let written = write_file_blocks(
            temp.path(),
            &task,
            base,
            &[
                block("summary", "# Summary"),
                block("result.json", "{\"ok\": true}"),
                block("extra/notes.txt", "notes"),
            ],
        );

        assert_eq!(written.len(), 3);
        assert_eq!(
            fs::read_to_string(temp.path().join("out/summary.md")).expect("summary"),
            "# Summary"
        );
        // Matched by file name of the declared main_result path.
        assert!(temp.path().join("results/report/result.json").is_file());
        assert!(temp.path().join("results/report/extra/notes.txt").is_file());
    }

    #[test]
    fn escaping_block_names_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let written = write_file_blocks(
            temp.path(),
            &subtask("a"),
            Path::new("results/a"),
            &[block("../../etc/passwd", "nope")],
        );
        assert!(written.is_empty());
    }

    #[test]
    fn missing_outputs_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = subtask("a");
        assert_eq!(missing_outputs(temp.path(), &task).len(), 1);

        ensure_output_dirs(temp.path(), &task).expect("dirs");
        fs::write(temp.path().join("results/a/result.json"), "{}").expect("write");
        assert!(missing_outputs(temp.path(), &task).is_empty());
    }

    /// A directory sitting at a declared output path does not count as the output.
    #[test]
    fn directory_at_output_path_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = subtask("a");
        fs::create_dir_all(temp.path().join("results/a/result.json")).expect("mkdir");

        let missing = missing_outputs(temp.path(), &task);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, "main_result");
    }

    #[test]
    fn lists_files_relative_to_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("nested")).expect("mkdir");
        fs::write(temp.path().join("b.txt"), "b").expect("write");
        fs::write(temp.path().join("nested/a.txt"), "a").expect("write");

        let rels: Vec<String> = list_files(temp.path()).into_iter().map(|(rel, _)| rel).collect();
        assert_eq!(rels, vec!["b.txt", "nested/a.txt"]);
        assert!(list_files(&temp.path().join("missing")).is_empty());
    }
}
