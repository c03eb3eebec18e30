//! Per-subtask contexts and the store that owns them.
//!
//! Every piece of state a subtask reads or writes lives in its [`TaskContext`].
//! The [`ContextStore`] owns all contexts and is only mutated on the scheduling
//! thread. Workers execute on contexts they have checked out, so propagation
//! into a running subtask is rejected instead of racing with it.
//!
//! The global context is an immutable, versioned snapshot shared by `Arc`.
//! Contexts queue global writes; the store applies them at check-in.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use crate::core::types::Subtask;
use crate::io::artifacts::resolve_path;
use crate::io::{now_rfc3339, write_json_atomic};

/// Well-known `local_context` keys.
pub mod keys {
    pub const PARENT_TASK_ID: &str = "_parent_task_id";
    pub const TASK_DEFINITION: &str = "task_definition";
    pub const PROGRESS: &str = "progress";
    pub const DEPENDENCY_RESULTS: &str = "dependency_results";
    pub const DEPENDENCY_FILES: &str = "dependency_files";
    pub const INPUT_FILES_MAPPING: &str = "input_files_mapping";
    pub const CONVERSATION_HISTORY: &str = "conversation_history";
    pub const SUCCESS: &str = "success";
    pub const SUMMARY: &str = "summary";
    pub const RESULT: &str = "result";
    pub const RESULT_DATA: &str = "result_data";
    pub const TASK_STATUS: &str = "task_status";
    pub const COMPLETION_TIME: &str = "completion_time";
    pub const ANALYSIS: &str = "analysis";
    pub const ANALYSIS_SUMMARY: &str = "analysis_summary";
    pub const SUBTASKS: &str = "subtasks";
    pub const TASK_DESCRIPTION: &str = "task_description";
    pub const ADJUSTED_PLAN: &str = "adjusted_plan";
    pub const CREATED_FROM_ADJUSTMENT: &str = "created_from_adjustment";
    pub const PARENT_TASK: &str = "parent_task";
    pub const MODIFIED_FROM_ADJUSTMENT: &str = "modified_from_adjustment";
    pub const MODIFICATION_REASON: &str = "modification_reason";
}

/// Keys describing a context's own identity or outcome; never copied by
/// default propagation. Producer outcomes reach dependents through
/// `dependency_results` instead.
const IDENTITY_KEYS: &[&str] = &[
    keys::TASK_DEFINITION,
    keys::PROGRESS,
    keys::PARENT_TASK_ID,
    keys::DEPENDENCY_RESULTS,
    keys::DEPENDENCY_FILES,
    keys::INPUT_FILES_MAPPING,
    keys::CONVERSATION_HISTORY,
    keys::SUCCESS,
    keys::SUMMARY,
    keys::RESULT,
    keys::RESULT_DATA,
    keys::TASK_STATUS,
    keys::COMPLETION_TIME,
    keys::CREATED_FROM_ADJUSTMENT,
    keys::PARENT_TASK,
    keys::MODIFIED_FROM_ADJUSTMENT,
    keys::MODIFICATION_REASON,
];

const OUTPUT_FILE_ROLE: &str = "output_file";
const SNAPSHOT_DIR: &str = "contexts";
const GLOBAL_FILE: &str = "global_context.json";
const HISTORY_FILE: &str = "context_history.json";

/// Shared key/value state visible to every context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalContext {
    pub version: u64,
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Code,
    Data,
    Text,
    Image,
    #[default]
    Unknown,
}

/// Provenance entry appended each time a reference is propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub source_task: String,
    pub propagated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(rename = "type", default)]
    pub kind: Option<FileKind>,
    /// What the file is to this context (`output_file`, `input_file`, `artifact`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl FileMetadata {
    pub fn with_role(role: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            ..Self::default()
        }
    }

    /// Metadata for a file a subtask declared as one of its outputs.
    pub fn output(created_by: &str, output_type: &str) -> Self {
        Self {
            created_by: Some(created_by.to_string()),
            output_type: Some(output_type.to_string()),
            ..Self::with_role(OUTPUT_FILE_ROLE)
        }
    }

    pub fn is_output(&self) -> bool {
        self.role.as_deref() == Some(OUTPUT_FILE_ROLE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub path: PathBuf,
    pub metadata: FileMetadata,
    pub added_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub action: String,
    pub result: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: String,
}

/// Content of a referenced file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    Json(Value),
    Text(String),
}

/// Isolated state for one subtask (or the planner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    #[serde(
        serialize_with = "serialize_global",
        deserialize_with = "deserialize_global",
        default
    )]
    pub global_context: Arc<GlobalContext>,
    #[serde(default)]
    pub local_context: Map<String, Value>,
    #[serde(default)]
    pub file_paths: BTreeMap<String, FileReference>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(skip)]
    pending_global: Map<String, Value>,
}

fn serialize_global<S: Serializer>(global: &Arc<GlobalContext>, s: S) -> Result<S::Ok, S::Error> {
    global.as_ref().serialize(s)
}

fn deserialize_global<'de, D: Deserializer<'de>>(d: D) -> Result<Arc<GlobalContext>, D::Error> {
    GlobalContext::deserialize(d).map(Arc::new)
}

impl TaskContext {
    pub fn new(task_id: &str, global: Arc<GlobalContext>, base_dir: Option<PathBuf>) -> Self {
        Self {
            task_id: task_id.to_string(),
            global_context: global,
            local_context: Map::new(),
            file_paths: BTreeMap::new(),
            execution_history: Vec::new(),
            base_dir,
            pending_global: Map::new(),
        }
    }

    pub fn update_local(&mut self, key: &str, value: Value) {
        self.local_context.insert(key.to_string(), value);
    }

    pub fn local(&self, key: &str) -> Option<&Value> {
        self.local_context.get(key)
    }

    /// Queue a global write; it becomes visible to other contexts at check-in.
    pub fn update_global(&mut self, key: &str, value: Value) {
        self.pending_global.insert(key.to_string(), value);
    }

    /// Read a global value, seeing this context's own queued writes first.
    pub fn global(&self, key: &str) -> Option<&Value> {
        self.pending_global
            .get(key)
            .or_else(|| self.global_context.values.get(key))
    }

    /// Register a file under a logical name, inferring its kind when unset.
    pub fn add_file_reference(
        &mut self,
        name: &str,
        path: impl Into<PathBuf>,
        mut metadata: FileMetadata,
    ) {
        let path = path.into();
        if metadata.kind.is_none() {
            metadata.kind = Some(infer_file_kind(&path));
        }
        self.file_paths.insert(
            name.to_string(),
            FileReference {
                path,
                metadata,
                added_at: now_rfc3339(),
            },
        );
    }

    /// Load a referenced file: JSON for `.json` paths, text otherwise.
    pub fn get_file_content(&self, name: &str) -> Option<FileContent> {
        let reference = self.file_paths.get(name)?;
        let path = &reference.path;
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(task = %self.task_id, name, path = %path.display(), %err, "cannot read file reference");
                return None;
            }
        };
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if !is_json {
            return Some(FileContent::Text(raw));
        }
        match serde_json::from_str(&raw) {
            Ok(value) => Some(FileContent::Json(value)),
            Err(err) => {
                warn!(task = %self.task_id, name, path = %path.display(), %err, "invalid JSON in file reference");
                None
            }
        }
    }

    pub fn add_execution_record(&mut self, action: &str, result: &str, metadata: Map<String, Value>) {
        self.execution_history.push(ExecutionRecord {
            action: action.to_string(),
            result: result.to_string(),
            metadata,
            timestamp: now_rfc3339(),
        });
    }

    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).with_context(|| format!("serialize context {}", self.task_id))
    }

    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("deserialize task context")
    }

    fn take_pending_global(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.pending_global)
    }
}

/// Classify a file by extension, falling back to its leading bytes.
pub fn infer_file_kind(path: &Path) -> FileKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some(
            "py" | "js" | "ts" | "java" | "c" | "cpp" | "h" | "cs" | "go" | "rs" | "rb" | "php"
            | "swift" | "kt" | "scala" | "sh" | "sql",
        ) => return FileKind::Code,
        Some("json" | "yaml" | "yml" | "xml" | "csv" | "toml") => return FileKind::Data,
        Some("md" | "txt" | "rst" | "log") => return FileKind::Text,
        Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "bmp" | "webp") => return FileKind::Image,
        _ => {}
    }

    let mut head = Vec::with_capacity(512);
    let Ok(file) = fs::File::open(path) else {
        return FileKind::Unknown;
    };
    if file.take(512).read_to_end(&mut head).is_err() || head.is_empty() {
        return FileKind::Unknown;
    }
    if head.starts_with(b"\x89PNG") || head.starts_with(b"\xFF\xD8\xFF") || head.starts_with(b"GIF8")
    {
        return FileKind::Image;
    }
    let first = head.iter().find(|b| !b.is_ascii_whitespace()).copied();
    if matches!(first, Some(b'{' | b'[')) {
        return FileKind::Data;
    }
    if std::str::from_utf8(&head).is_ok() {
        FileKind::Text
    } else {
        FileKind::Unknown
    }
}

/// Audit entry for a store-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEvent {
    pub event_type: String,
    pub primary_id: String,
    #[serde(default)]
    pub secondary_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    pub timestamp: String,
}

/// Digest of one context used by planner prompts and run summaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub task_id: String,
    pub success: Option<bool>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub files: BTreeMap<String, PathBuf>,
    pub history_len: usize,
    pub last_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
}

/// Owner of every task context in a run.
#[derive(Debug)]
pub struct ContextStore {
    context_dir: PathBuf,
    global: Arc<GlobalContext>,
    contexts: BTreeMap<String, TaskContext>,
    checked_out: BTreeSet<String>,
    history: Vec<ContextEvent>,
}

impl ContextStore {
    /// Create an empty store rooted at `context_dir` (the run directory).
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
            global: Arc::new(GlobalContext::default()),
            contexts: BTreeMap::new(),
            checked_out: BTreeSet::new(),
            history: Vec::new(),
        }
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    pub fn history(&self) -> &[ContextEvent] {
        &self.history
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskContext> {
        self.contexts.get(task_id)
    }

    /// Mutable access to a resident (not checked-out) context.
    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut TaskContext> {
        self.contexts.get_mut(task_id)
    }

    pub fn is_checked_out(&self, task_id: &str) -> bool {
        self.checked_out.contains(task_id)
    }

    /// Get or create a root context (e.g. the planner's own).
    pub fn ensure_context(&mut self, task_id: &str) -> &mut TaskContext {
        if !self.contexts.contains_key(task_id) {
            self.record("create", task_id, None, None);
        }
        let global = Arc::clone(&self.global);
        self.contexts
            .entry(task_id.to_string())
            .or_insert_with(|| TaskContext::new(task_id, global, None))
    }

    /// Create a subtask context that inherits the parent's local state.
    ///
    /// `inherit` limits the copied keys; `None` copies them all.
    pub fn create_subtask_context(
        &mut self,
        parent_id: &str,
        task_id: &str,
        inherit: Option<&[&str]>,
    ) -> &mut TaskContext {
        let mut local = Map::new();
        match self.contexts.get(parent_id) {
            Some(parent) => {
                for (key, value) in &parent.local_context {
                    if inherit.is_none_or(|keys| keys.contains(&key.as_str())) {
                        local.insert(key.clone(), value.clone());
                    }
                }
            }
            None => warn!(parent = parent_id, task = task_id, "parent context missing"),
        }
        local.insert(keys::PARENT_TASK_ID.to_string(), json!(parent_id));

        let base_dir = self.context_dir.join("results").join(task_id);
        let mut context = TaskContext::new(task_id, Arc::clone(&self.global), Some(base_dir));
        context.local_context = local;
        self.record("create", task_id, Some(parent_id), None);
        match self.contexts.entry(task_id.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(context);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(context),
        }
    }

    /// Merge `updates` into a context's local state, optionally mirroring them globally.
    pub fn update_task_context(
        &mut self,
        task_id: &str,
        updates: Map<String, Value>,
        also_global: bool,
    ) -> Result<()> {
        self.ensure_resident(task_id)?;
        let keys: Vec<String> = updates.keys().cloned().collect();
        if also_global {
            for (key, value) in &updates {
                self.update_global(key, value.clone());
            }
        }
        let context = self
            .contexts
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("unknown context {task_id}"))?;
        for (key, value) in updates {
            context.local_context.insert(key, value);
        }
        self.record("update", task_id, None, Some(json!({ "keys": keys })));
        Ok(())
    }

    /// Write a global value and refresh every resident context's snapshot.
    pub fn update_global(&mut self, key: &str, value: Value) {
        let global = Arc::make_mut(&mut self.global);
        global.values.insert(key.to_string(), value);
        global.version += 1;
        let version = global.version;
        self.refresh_global();
        self.record("global_update", key, None, Some(json!({ "version": version })));
    }

    /// Copy results and file references from one context into others.
    ///
    /// `keys` and `file_keys` limit what is copied; `None` copies every local
    /// key except identity keys, and every file reference. Unknown ids are
    /// skipped with a warning. Propagating into a checked-out (running)
    /// context is an error.
    #[instrument(skip_all, fields(from = from_id, targets = to_ids.len()))]
    pub fn propagate_results(
        &mut self,
        from_id: &str,
        to_ids: &[String],
        keys: Option<&[&str]>,
        file_keys: Option<&[&str]>,
    ) -> Result<()> {
        if self.is_checked_out(from_id) {
            bail!("cannot propagate from {from_id}: context is executing");
        }
        if let Some(busy) = to_ids.iter().find(|id| self.is_checked_out(id)) {
            bail!("cannot propagate into {busy}: context is executing");
        }
        let Some(source) = self.contexts.get(from_id) else {
            warn!(from = from_id, "propagation source missing; skipping");
            return Ok(());
        };

        let values: Vec<(String, Value)> = source
            .local_context
            .iter()
            .filter(|(key, _)| match keys {
                Some(selected) => selected.contains(&key.as_str()),
                None => !IDENTITY_KEYS.contains(&key.as_str()),
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let files: Vec<(String, FileReference)> = source
            .file_paths
            .iter()
            .filter(|(name, _)| file_keys.is_none_or(|selected| selected.contains(&name.as_str())))
            .map(|(name, reference)| (name.clone(), reference.clone()))
            .collect();
        let dependency_result = dependency_result_of(source);
        let dependency_files: Map<String, Value> = source
            .file_paths
            .values()
            .filter(|reference| reference.metadata.is_output())
            .filter_map(|reference| {
                let name = reference.metadata.output_type.clone()?;
                Some((name, json!(reference.path)))
            })
            .collect();

        let stamp = now_rfc3339();
        for to_id in to_ids {
            let Some(target) = self.contexts.get_mut(to_id) else {
                warn!(from = from_id, to = %to_id, "propagation target missing; skipping");
                continue;
            };
            for (key, value) in &values {
                target.local_context.insert(key.clone(), value.clone());
            }
            for (name, reference) in &files {
                // A target's own outputs keep their names; the source's copy is prefixed.
                let owned = target.file_paths.get(name).is_some_and(|existing| {
                    existing.metadata.created_by.as_deref() == Some(to_id.as_str())
                });
                let name = if owned { format!("{from_id}.{name}") } else { name.clone() };
                let mut reference = reference.clone();
                reference.metadata.references.push(Reference {
                    source_task: from_id.to_string(),
                    propagated_at: stamp.clone(),
                });
                target.file_paths.insert(name, reference);
            }
            insert_nested(target, keys::DEPENDENCY_RESULTS, from_id, dependency_result.clone());
            insert_nested(
                target,
                keys::DEPENDENCY_FILES,
                from_id,
                Value::Object(dependency_files.clone()),
            );
            debug!(from = from_id, to = %to_id, keys = values.len(), files = files.len(), "propagated");
        }

        for to_id in to_ids {
            self.record(
                "propagate",
                from_id,
                Some(to_id),
                Some(json!({ "keys": values.len(), "files": files.len() })),
            );
        }
        Ok(())
    }

    /// Take a context out of the store for execution on a worker.
    pub fn checkout(&mut self, task_id: &str) -> Result<TaskContext> {
        if self.is_checked_out(task_id) {
            bail!("context {task_id} is already checked out");
        }
        let context = self
            .contexts
            .remove(task_id)
            .ok_or_else(|| anyhow!("unknown context {task_id}"))?;
        self.checked_out.insert(task_id.to_string());
        Ok(context)
    }

    /// Return a checked-out context, applying its queued global writes.
    pub fn check_in(&mut self, mut context: TaskContext) {
        let task_id = context.task_id.clone();
        let pending = context.take_pending_global();
        let writes = pending.len();
        for (key, value) in pending {
            self.update_global(&key, value);
        }
        context.global_context = Arc::clone(&self.global);
        self.checked_out.remove(&task_id);
        self.contexts.insert(task_id.clone(), context);
        self.record("check_in", &task_id, None, Some(json!({ "global_writes": writes })));
    }

    pub fn execution_summary(&self, task_id: &str) -> Option<ExecutionSummary> {
        let context = self.contexts.get(task_id)?;
        let result = context.local(keys::RESULT);
        Some(ExecutionSummary {
            task_id: task_id.to_string(),
            success: context.local(keys::SUCCESS).and_then(Value::as_bool),
            summary: context
                .local(keys::SUMMARY)
                .and_then(Value::as_str)
                .map(str::to_string),
            error: result
                .and_then(|r| r.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string),
            files: context
                .file_paths
                .iter()
                .map(|(name, reference)| (name.clone(), reference.path.clone()))
                .collect(),
            history_len: context.execution_history.len(),
            last_action: context.execution_history.last().map(|r| r.action.clone()),
            result_data: context.local(keys::RESULT_DATA).cloned(),
        })
    }

    /// Create output directories and write each subtask definition to `subtasks/<id>.json`.
    pub fn create_output_directories(&self, subtasks: &[Subtask]) -> Result<()> {
        let definitions = self.context_dir.join("subtasks");
        for subtask in subtasks {
            let results = self.context_dir.join("results").join(&subtask.id);
            fs::create_dir_all(&results)
                .with_context(|| format!("create {}", results.display()))?;
            for path in subtask.output_files.values() {
                if let Some(parent) = resolve_path(&self.context_dir, path).parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create output dir {}", parent.display()))?;
                }
            }
            write_json_atomic(&definitions.join(format!("{}.json", subtask.id)), subtask)?;
        }
        Ok(())
    }

    /// Persist the global context, every resident context and the event history.
    pub fn save_all(&self) -> Result<()> {
        let dir = self.context_dir.join(SNAPSHOT_DIR);
        write_json_atomic(&dir.join(GLOBAL_FILE), self.global.as_ref())?;
        for (task_id, context) in &self.contexts {
            write_json_atomic(&dir.join(format!("task_{task_id}.json")), context)?;
        }
        if !self.checked_out.is_empty() {
            warn!(checked_out = ?self.checked_out, "saving while contexts are executing");
        }
        write_json_atomic(&dir.join(HISTORY_FILE), &self.history)?;
        debug!(contexts = self.contexts.len(), dir = %dir.display(), "contexts saved");
        Ok(())
    }

    /// Load a store previously written by [`ContextStore::save_all`].
    pub fn load_all(context_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::new(context_dir);
        let dir = store.context_dir.join(SNAPSHOT_DIR);
        if !dir.is_dir() {
            bail!("no saved contexts in {}", dir.display());
        }

        let global_path = dir.join(GLOBAL_FILE);
        if global_path.exists() {
            store.global = Arc::new(read_json(&global_path)?);
        }
        let history_path = dir.join(HISTORY_FILE);
        if history_path.exists() {
            store.history = read_json(&history_path)?;
        }

        let entries = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;
        for entry in entries {
            let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
            let is_task_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("task_") && n.ends_with(".json"));
            if !is_task_file {
                continue;
            }
            let mut context: TaskContext = read_json(&path)?;
            context.global_context = Arc::clone(&store.global);
            store.contexts.insert(context.task_id.clone(), context);
        }
        debug!(contexts = store.contexts.len(), "contexts loaded");
        Ok(store)
    }

    fn ensure_resident(&self, task_id: &str) -> Result<()> {
        if self.is_checked_out(task_id) {
            bail!("context {task_id} is executing");
        }
        if !self.contexts.contains_key(task_id) {
            bail!("unknown context {task_id}");
        }
        Ok(())
    }

    fn refresh_global(&mut self) {
        for context in self.contexts.values_mut() {
            context.global_context = Arc::clone(&self.global);
        }
    }

    fn record(&mut self, event_type: &str, primary: &str, secondary: Option<&str>, data: Option<Value>) {
        self.history.push(ContextEvent {
            event_type: event_type.to_string(),
            primary_id: primary.to_string(),
            secondary_id: secondary.map(str::to_string),
            data,
            timestamp: now_rfc3339(),
        });
    }
}

fn dependency_result_of(source: &TaskContext) -> Value {
    let result = source.local(keys::RESULT);
    let body = result.and_then(|r| r.get("result"));
    json!({
        "success": source.local(keys::SUCCESS).cloned().unwrap_or(Value::Bool(false)),
        "summary": body
            .and_then(|b| b.get("summary"))
            .or_else(|| source.local(keys::SUMMARY))
            .cloned()
            .unwrap_or(Value::Null),
        "details": body.and_then(|b| b.get("details")).cloned().unwrap_or(Value::Null),
    })
}

fn insert_nested(target: &mut TaskContext, key: &str, inner_key: &str, value: Value) {
    let slot = target
        .local_context
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(map) = slot {
        map.insert(inner_key.to_string(), value);
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
