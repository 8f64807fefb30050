//! Filesystem task store: one directory per task, one YAML document each.
//!
//! Layout under the workspace artifact root:
//!
//! ```text
//! <artifactRoot>/
//!   .task-id-counter.json
//!   tasks/
//!     <PREFIX>-<n>/
//!       task.yaml
//!       attachments/
//!       conversation-archive.jsonl   # written on archive
//! ```
//!
//! Reads are lock-free directory scans; writes are serialised per file path.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FactoryError, Result};
use crate::tasks::model::*;

const TASK_FILE: &str = "task.yaml";
const COUNTER_FILE: &str = ".task-id-counter.json";
const ARCHIVE_SNAPSHOT: &str = "conversation-archive.jsonl";
/// Bytes of a task file scanned for the `phase:` line before a full parse.
const PHASE_SCAN_BYTES: usize = 4096;
/// Retries when an allocated id collides with a directory created out-of-band.
const ID_RETRIES: u32 = 8;

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub pre_execution_skills: Vec<String>,
    #[serde(default)]
    pub post_execution_skills: Vec<String>,
    #[serde(default)]
    pub pre_planning_skills: Vec<String>,
    #[serde(default)]
    pub skill_configs: Option<std::collections::BTreeMap<String, std::collections::BTreeMap<String, String>>>,
    #[serde(default)]
    pub execution_model_config: Option<ModelConfig>,
    #[serde(default)]
    pub planning_model_config: Option<ModelConfig>,
    #[serde(default)]
    pub planning_skipped: Option<bool>,
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<Vec<AcceptanceCriterion>>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub blocked: Option<BlockedState>,
    #[serde(default)]
    pub planning_status: Option<PlanningStatus>,
    #[serde(default)]
    pub planning_skipped: Option<bool>,
    #[serde(default)]
    pub awaiting_user_input: Option<bool>,
    #[serde(default)]
    pub execution_model_config: Option<ModelConfig>,
    #[serde(default)]
    pub planning_model_config: Option<ModelConfig>,
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

/// Discovery scope: everything, non-archived, or archived only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope {
    All,
    Active,
    Archived,
}

impl TaskScope {
    fn includes(&self, phase: Phase) -> bool {
        match self {
            TaskScope::All => true,
            TaskScope::Active => phase != Phase::Archived,
            TaskScope::Archived => phase == Phase::Archived,
        }
    }
}

// ─── Counter file ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Default)]
struct CounterFile {
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    counter: u64,
}

/// Derive the task-id prefix from the workspace folder name: first four
/// alphabetic characters, uppercased. Folders with no alphabetic characters
/// fall back to `TASK`.
pub fn id_prefix_for(workspace_path: &Path) -> String {
    let name = workspace_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let prefix: String = name
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(4)
        .collect::<String>()
        .to_uppercase();
    if prefix.is_empty() {
        "TASK".to_string()
    } else {
        prefix
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct TaskStore {
    artifact_root: PathBuf,
    tasks_dir: PathBuf,
    prefix: String,
    /// Serialises id allocation; the counter file is single-writer per
    /// workspace in practice, with retry-on-collision as the fallback.
    alloc_lock: Mutex<()>,
    /// Per-file-path write locks.
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl TaskStore {
    pub fn new(workspace_path: &Path, artifact_root: &Path, tasks_dir: &Path) -> Self {
        Self {
            artifact_root: artifact_root.to_path_buf(),
            tasks_dir: tasks_dir.to_path_buf(),
            prefix: id_prefix_for(workspace_path),
            alloc_lock: Mutex::new(()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.write_locks.lock().await;
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ─── Create ──────────────────────────────────────────────────────────────

    /// Create a new task in `backlog`, inserted at the head of the phase
    /// (`order = min(existing) - 1`).
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task> {
        tokio::fs::create_dir_all(&self.tasks_dir).await?;

        let now = Utc::now();
        let existing = self.discover_tasks(TaskScope::All).await?;
        let head_order = existing
            .iter()
            .filter(|t| t.phase() == Phase::Backlog)
            .map(|t| t.frontmatter.order)
            .min()
            .map(|m| m - 1)
            .unwrap_or(0);

        let (id, task_dir) = self.allocate_task_dir(&existing).await?;

        let mut fm = TaskFrontmatter::new(id, now);
        fm.order = head_order;
        fm.title = request.title;
        fm.acceptance_criteria = request
            .acceptance_criteria
            .into_iter()
            .map(AcceptanceCriterion::new)
            .collect();
        fm.pre_execution_skills = request.pre_execution_skills;
        fm.post_execution_skills = request.post_execution_skills;
        fm.pre_planning_skills = request.pre_planning_skills;
        fm.skill_configs = request.skill_configs;
        fm.execution_model_config = request.execution_model_config;
        fm.planning_model_config = request.planning_model_config;
        fm.planning_skipped = request.planning_skipped;

        let task = Task {
            frontmatter: fm,
            description: request.description,
            history: Vec::new(),
            file_path: task_dir.join(TASK_FILE),
        };

        tokio::fs::create_dir_all(task_dir.join("attachments")).await?;
        self.persist(&task).await?;
        info!(id = %task.id(), dir = %task_dir.display(), "task created");
        Ok(task)
    }

    /// Allocate the next task id and create its directory.
    ///
    /// `max(counter file, highest numeric suffix on disk) + 1` — manual file
    /// edits can only push the counter forward, never cause id reuse.
    async fn allocate_task_dir(&self, existing: &[Task]) -> Result<(String, PathBuf)> {
        let _guard = self.alloc_lock.lock().await;
        let counter_path = self.artifact_root.join(COUNTER_FILE);

        let persisted = match tokio::fs::read_to_string(&counter_path).await {
            Ok(raw) => serde_json::from_str::<CounterFile>(&raw)
                .map(|c| c.counter)
                .unwrap_or(0),
            Err(_) => 0,
        };
        let on_disk = existing
            .iter()
            .filter_map(|t| numeric_suffix(t.id(), &self.prefix))
            .max()
            .unwrap_or(0);

        let mut next = persisted.max(on_disk) + 1;
        for _ in 0..ID_RETRIES {
            let id = format!("{}-{}", self.prefix, next);
            let dir = self.tasks_dir.join(&id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => {
                    self.write_counter(&counter_path, next).await?;
                    return Ok((id, dir));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(id, "task id collided with on-disk directory, retrying");
                    next += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FactoryError::validation(format!(
            "could not allocate a task id after {ID_RETRIES} attempts"
        )))
    }

    async fn write_counter(&self, counter_path: &Path, counter: u64) -> Result<()> {
        let body = serde_json::to_string_pretty(&CounterFile {
            prefix: self.prefix.clone(),
            counter,
        })
        .expect("counter file serializes");
        atomic_write(counter_path, body.as_bytes()).await
    }

    // ─── Update ──────────────────────────────────────────────────────────────

    /// Apply a partial update. Blocked transitions maintain the monotonic
    /// `blocked_count` / `blocked_duration` aggregates; `updated` is always
    /// bumped.
    pub async fn update_task(&self, task: &Task, request: UpdateTaskRequest) -> Result<Task> {
        let mut task = task.clone();
        let now = Utc::now();
        let fm = &mut task.frontmatter;

        if let Some(title) = request.title {
            fm.title = Some(title);
        }
        if let Some(description) = request.description {
            task.description = description;
        }
        let fm = &mut task.frontmatter;
        if let Some(criteria) = request.acceptance_criteria {
            fm.acceptance_criteria = criteria;
        }
        if let Some(plan) = request.plan {
            fm.plan = Some(plan);
        }
        if let Some(blocked) = request.blocked {
            match (fm.blocked.is_blocked, blocked.is_blocked) {
                (false, true) => {
                    fm.blocked_count += 1;
                    fm.blocked = BlockedState {
                        is_blocked: true,
                        reason: blocked.reason,
                        since: Some(blocked.since.unwrap_or(now)),
                    };
                }
                (true, false) => {
                    if let Some(since) = fm.blocked.since {
                        let span = (now - since).num_seconds().max(0);
                        fm.blocked_duration += span;
                    }
                    fm.blocked = BlockedState::default();
                }
                _ => fm.blocked.reason = blocked.reason,
            }
        }
        if let Some(status) = request.planning_status {
            fm.planning_status = status;
        }
        if let Some(skipped) = request.planning_skipped {
            fm.planning_skipped = Some(skipped);
        }
        if let Some(awaiting) = request.awaiting_user_input {
            fm.awaiting_user_input = awaiting;
        }
        if let Some(cfg) = request.execution_model_config {
            fm.execution_model_config = Some(cfg);
        }
        if let Some(cfg) = request.planning_model_config {
            fm.planning_model_config = Some(cfg);
        }
        if let Some(file) = request.session_file {
            fm.session_file = Some(file);
        }
        fm.updated = now;

        self.persist(&task).await?;
        Ok(task)
    }

    /// Merge one usage sample into the task's metrics and persist.
    pub async fn record_usage(&self, task: &Task, sample: &UsageSample) -> Result<Task> {
        let mut task = task.clone();
        task.frontmatter.usage_metrics.record(sample);
        task.frontmatter.updated = Utc::now();
        self.persist(&task).await?;
        Ok(task)
    }

    // ─── Phase moves ─────────────────────────────────────────────────────────

    /// Check the transition table and phase guards without mutating anything.
    pub fn can_move_to_phase(&self, task: &Task, target: Phase) -> TransitionCheck {
        can_move_to_phase(task, target)
    }

    /// Move a task to a new phase: history entry, timestamp bookkeeping,
    /// insert at the head of the target phase.
    ///
    /// `peers` avoids a rescan when the caller already holds a snapshot; pass
    /// `None` to let the store discover siblings itself.
    pub async fn move_task_to_phase(
        &self,
        task: &Task,
        target: Phase,
        actor: Actor,
        reason: Option<String>,
        peers: Option<&[Task]>,
    ) -> Result<Task> {
        let check = can_move_to_phase(task, target);
        if !check.allowed {
            return Err(FactoryError::InvalidTransition {
                from: task.frontmatter.phase,
                to: target,
                reason: check.reason.unwrap_or_default(),
            });
        }

        let discovered;
        let peers = match peers {
            Some(p) => p,
            None => {
                discovered = self.discover_tasks(TaskScope::All).await?;
                &discovered
            }
        };

        let mut task = task.clone();
        let now = Utc::now();
        let from = task.frontmatter.phase;

        task.history.push(PhaseTransition {
            from,
            to: target,
            timestamp: now,
            actor,
            reason,
        });

        let fm = &mut task.frontmatter;
        fm.phase = target;
        fm.order = peers
            .iter()
            .filter(|t| t.phase() == target && t.id() != fm.id)
            .map(|t| t.frontmatter.order)
            .min()
            .map(|m| m - 1)
            .unwrap_or(0);

        // A task leaving `executing` is no longer parked.
        if from == Phase::Executing {
            fm.awaiting_user_input = false;
        }

        match target {
            Phase::Executing => {
                if fm.started.is_none() {
                    fm.started = Some(now);
                }
            }
            Phase::Complete => {
                // Restoring archived -> complete keeps the original
                // completion metadata.
                if !(from == Phase::Archived && fm.completed.is_some()) {
                    fm.completed = Some(now);
                    fm.lead_time = Some((now - fm.created).num_seconds().max(0));
                    fm.cycle_time = fm
                        .started
                        .map(|s| (now - s).num_seconds().max(0));
                }
            }
            Phase::Ready if from == Phase::Complete => {
                // Re-open: completion metadata is recomputed on the next pass.
                fm.completed = None;
                fm.started = None;
                fm.cycle_time = None;
                fm.lead_time = None;
            }
            _ => {}
        }
        fm.updated = now;

        self.persist(&task).await?;

        if target == Phase::Archived {
            self.snapshot_conversation(&task).await;
        }

        info!(id = %task.id(), from = %from, to = %target, "task moved");
        Ok(task)
    }

    /// Best-effort copy of the task's session record into the task directory.
    /// Failure is logged, never raised — archiving must not depend on the
    /// engine's files being readable.
    async fn snapshot_conversation(&self, task: &Task) {
        let Some(ref session_file) = task.frontmatter.session_file else {
            return;
        };
        let dest = task.dir().join(ARCHIVE_SNAPSHOT);
        match tokio::fs::copy(session_file, &dest).await {
            Ok(bytes) => debug!(id = %task.id(), bytes, "conversation snapshot written"),
            Err(e) => warn!(
                id = %task.id(),
                src = %session_file.display(),
                err = %e,
                "conversation snapshot failed"
            ),
        }
    }

    // ─── Discovery ───────────────────────────────────────────────────────────

    /// Scan the tasks directory, returning tasks in `(order asc, created asc)`
    /// order. Unparseable files are skipped and logged.
    pub async fn discover_tasks(&self, scope: TaskScope) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.tasks_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(TASK_FILE);
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match self.scan_phase(&path).await {
                Ok(Some(phase)) if !scope.includes(phase) => continue,
                Ok(_) => {}
                Err(_) => continue, // no task.yaml in this directory
            }
            match self.load_task(&path).await {
                Ok(task) => {
                    if scope.includes(task.phase()) {
                        out.push(task);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "skipping unparseable task file");
                }
            }
        }

        out.sort_by(|a, b| {
            a.frontmatter
                .order
                .cmp(&b.frontmatter.order)
                .then(a.frontmatter.created.cmp(&b.frontmatter.created))
        });
        Ok(out)
    }

    /// Read a bounded prefix of the file and look for a `phase:` line, so
    /// out-of-scope tasks are filtered without a full YAML parse.
    async fn scan_phase(&self, path: &Path) -> Result<Option<Phase>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; PHASE_SCAN_BYTES];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        let text = String::from_utf8_lossy(&buf);
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("phase:") {
                return Ok(Some(Phase::parse_lenient(rest)));
            }
        }
        Ok(None)
    }

    pub async fn load_task(&self, path: &Path) -> Result<Task> {
        let raw = tokio::fs::read_to_string(path).await?;
        let doc: TaskDocument = serde_yaml::from_str(&raw)?;
        Ok(Task::from_document(doc, path.to_path_buf()))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let path = self.tasks_dir.join(task_id).join(TASK_FILE);
        match self.load_task(&path).await {
            Ok(task) => Ok(task),
            Err(FactoryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FactoryError::not_found(format!("task {task_id}")))
            }
            Err(e) => Err(e),
        }
    }

    // ─── Reorder / delete ────────────────────────────────────────────────────

    /// Rewrite `order = index` for each id in `ordered_ids` within `phase`.
    pub async fn reorder_tasks(&self, phase: Phase, ordered_ids: &[String]) -> Result<Vec<Task>> {
        let mut out = Vec::with_capacity(ordered_ids.len());
        for (index, id) in ordered_ids.iter().enumerate() {
            let mut task = self.get_task(id).await?;
            if task.phase() != phase {
                return Err(FactoryError::validation(format!(
                    "task {id} is in {}, not {phase}",
                    task.phase()
                )));
            }
            task.frontmatter.order = index as i64;
            task.frontmatter.updated = Utc::now();
            self.persist(&task).await?;
            out.push(task);
        }
        Ok(out)
    }

    /// Remove the task directory recursively.
    pub async fn delete_task(&self, task: &Task) -> Result<()> {
        let dir = task.dir().to_path_buf();
        let lock = self.lock_for(&task.file_path).await;
        let _guard = lock.lock().await;
        tokio::fs::remove_dir_all(&dir).await?;
        info!(id = %task.id(), "task deleted");
        Ok(())
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    async fn persist(&self, task: &Task) -> Result<()> {
        let doc = task.clone().into_document();
        let body = serde_yaml::to_string(&doc)?;
        let lock = self.lock_for(&task.file_path).await;
        let _guard = lock.lock().await;
        atomic_write(&task.file_path, body.as_bytes()).await
    }
}

fn numeric_suffix(id: &str, prefix: &str) -> Option<u64> {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|n| n.parse().ok())
}

/// Durable replace: write to a temp file in the same directory, then rename
/// over the destination.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        // The task directory is created at allocation time; a missing parent
        // means the task was deleted out from under us, and the write must
        // fail rather than resurrect the directory.
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| FactoryError::validation(format!("write task join error: {e}")))?
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> TaskStore {
        let ws = dir.join("demo");
        let root = dir.join("artifacts");
        TaskStore::new(&ws, &root, &root.join("tasks"))
    }

    fn request(description: &str, criteria: &[&str]) -> CreateTaskRequest {
        CreateTaskRequest {
            description: description.to_string(),
            acceptance_criteria: criteria.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_with_workspace_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let a = store.create_task(request("a", &[])).await.unwrap();
        let b = store.create_task(request("b", &[])).await.unwrap();
        assert_eq!(a.id(), "DEMO-1");
        assert_eq!(b.id(), "DEMO-2");
    }

    #[tokio::test]
    async fn counter_survives_manual_directory_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let a = store.create_task(request("a", &[])).await.unwrap();
        let b = store.create_task(request("b", &[])).await.unwrap();
        store.delete_task(&b).await.unwrap();
        store.delete_task(&a).await.unwrap();

        // Counter file still remembers 2; no id reuse.
        let c = store.create_task(request("c", &[])).await.unwrap();
        assert_eq!(c.id(), "DEMO-3");
    }

    #[tokio::test]
    async fn new_tasks_land_at_backlog_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let a = store.create_task(request("a", &[])).await.unwrap();
        let b = store.create_task(request("b", &[])).await.unwrap();
        assert!(b.frontmatter.order < a.frontmatter.order);

        let tasks = store.discover_tasks(TaskScope::Active).await.unwrap();
        assert_eq!(tasks[0].id(), b.id());
    }

    #[tokio::test]
    async fn roundtrip_preserves_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let task = store
            .create_task(request("ship X\nwith details", &["X ships"]))
            .await
            .unwrap();
        let loaded = store.get_task(task.id()).await.unwrap();
        assert_eq!(loaded.description, task.description);
        assert_eq!(
            loaded.frontmatter.acceptance_criteria[0].text,
            "X ships"
        );
        assert_eq!(loaded.history.len(), 0);
    }

    #[tokio::test]
    async fn move_records_history_and_times() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let task = store.create_task(request("d", &["a"])).await.unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Ready, Actor::User, None, None)
            .await
            .unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Executing, Actor::System, None, None)
            .await
            .unwrap();
        assert!(task.frontmatter.started.is_some());
        let task = store
            .move_task_to_phase(&task, Phase::Complete, Actor::Agent, None, None)
            .await
            .unwrap();

        assert_eq!(task.history.len(), 3);
        let cycle = task.frontmatter.cycle_time.unwrap();
        let lead = task.frontmatter.lead_time.unwrap();
        assert!(cycle >= 0);
        assert!(lead >= cycle);
        for t in &task.history {
            assert!(valid_transition(t.from, t.to));
        }
    }

    #[tokio::test]
    async fn reopen_clears_completion_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let task = store.create_task(request("d", &["a"])).await.unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Ready, Actor::User, None, None)
            .await
            .unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
            .await
            .unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Complete, Actor::User, None, None)
            .await
            .unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Ready, Actor::User, None, None)
            .await
            .unwrap();

        assert!(task.frontmatter.completed.is_none());
        assert!(task.frontmatter.started.is_none());
        assert!(task.frontmatter.cycle_time.is_none());
        assert!(task.frontmatter.lead_time.is_none());
    }

    #[tokio::test]
    async fn restore_from_archive_preserves_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let task = store.create_task(request("d", &["a"])).await.unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Complete, Actor::User, None, None)
            .await
            .unwrap();
        let completed = task.frontmatter.completed;
        let task = store
            .move_task_to_phase(&task, Phase::Archived, Actor::User, None, None)
            .await
            .unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Complete, Actor::User, None, None)
            .await
            .unwrap();
        assert_eq!(task.frontmatter.completed, completed);
    }

    #[tokio::test]
    async fn invalid_move_is_rejected_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let task = store.create_task(request("d", &[])).await.unwrap();
        let err = store
            .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[tokio::test]
    async fn reorder_is_stable_and_normalises() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let a = store.create_task(request("a", &[])).await.unwrap();
        let b = store.create_task(request("b", &[])).await.unwrap();
        let c = store.create_task(request("c", &[])).await.unwrap();

        let ids = vec![a.id().to_string(), c.id().to_string(), b.id().to_string()];
        store.reorder_tasks(Phase::Backlog, &ids).await.unwrap();

        let tasks = store.discover_tasks(TaskScope::Active).await.unwrap();
        let got: Vec<&str> = tasks.iter().map(|t| t.id()).collect();
        assert_eq!(got, vec![a.id(), c.id(), b.id()]);
        assert_eq!(tasks[0].frontmatter.order, 0);
        assert_eq!(tasks[2].frontmatter.order, 2);

        // Reordering by the current order is a no-op modulo normalisation.
        let same: Vec<String> = tasks.iter().map(|t| t.id().to_string()).collect();
        store.reorder_tasks(Phase::Backlog, &same).await.unwrap();
        let again = store.discover_tasks(TaskScope::Active).await.unwrap();
        let got2: Vec<&str> = again.iter().map(|t| t.id()).collect();
        assert_eq!(got, got2);
    }

    #[tokio::test]
    async fn blocked_aggregates_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let task = store.create_task(request("d", &[])).await.unwrap();

        let task = store
            .update_task(
                &task,
                UpdateTaskRequest {
                    blocked: Some(BlockedState {
                        is_blocked: true,
                        reason: Some("waiting on review".into()),
                        since: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(task.frontmatter.blocked_count, 1);
        assert!(task.frontmatter.blocked.is_blocked);

        let task = store
            .update_task(
                &task,
                UpdateTaskRequest {
                    blocked: Some(BlockedState::default()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!task.frontmatter.blocked.is_blocked);
        assert_eq!(task.frontmatter.blocked_count, 1);
        assert!(task.frontmatter.blocked_duration >= 0);
    }

    #[tokio::test]
    async fn discovery_scopes_filter_archived() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let a = store.create_task(request("a", &["c"])).await.unwrap();
        let _b = store.create_task(request("b", &[])).await.unwrap();
        store
            .move_task_to_phase(&a, Phase::Archived, Actor::User, None, None)
            .await
            .unwrap();

        assert_eq!(store.discover_tasks(TaskScope::All).await.unwrap().len(), 2);
        assert_eq!(
            store.discover_tasks(TaskScope::Active).await.unwrap().len(),
            1
        );
        let archived = store.discover_tasks(TaskScope::Archived).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id(), a.id());
    }

    #[tokio::test]
    async fn unparseable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.create_task(request("ok", &[])).await.unwrap();

        let bad = store.tasks_dir().join("DEMO-99");
        tokio::fs::create_dir_all(&bad).await.unwrap();
        tokio::fs::write(bad.join(TASK_FILE), "phase: [unclosed")
            .await
            .unwrap();

        let tasks = store.discover_tasks(TaskScope::All).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn archive_snapshots_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let session = dir.path().join("session.jsonl");
        tokio::fs::write(&session, "{\"event\":1}\n").await.unwrap();

        let task = store.create_task(request("d", &["a"])).await.unwrap();
        let task = store
            .update_task(
                &task,
                UpdateTaskRequest {
                    session_file: Some(session.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let task = store
            .move_task_to_phase(&task, Phase::Archived, Actor::User, None, None)
            .await
            .unwrap();

        let snapshot = task.dir().join(ARCHIVE_SNAPSHOT);
        let content = tokio::fs::read_to_string(snapshot).await.unwrap();
        assert!(content.contains("\"event\":1"));
    }
}
