//! Plan storage and session management for the plan-and-execute workflow.
//!
//! A plan session is a directory `plan_<timestamp>/` containing:
//!
//! - `workspace/`: the live copy the execution phase works against
//! - `frozen/`: an immutable snapshot of the workspace taken at finalize
//! - `plan_metadata.json`: lifecycle metadata
//! - `execution_log.jsonl`: append-only event log
//! - `plan_diff.json`: the last computed drift diff
//!
//! Lifecycle: *planning → ready → executing → completed | failed*.
//!
//! Once [`PlanStorage::finalize`] completes, `frozen/` is never written to
//! again; drift detection compares `workspace/plan.json` against
//! `frozen/plan.json` and reports added, removed and modified tasks plus a
//! divergence score in `[0, 1]`.

use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default location of plan sessions.
pub const DEFAULT_PLANS_DIR: &str = ".massgen/plans";

/// Lifecycle of a plan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Ready,
    Executing,
    Completed,
    Failed,
}

/// Metadata persisted as `plan_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub plan_id: String,
    pub created_at: String,
    pub planning_session_id: String,
    pub planning_log_dir: String,
    #[serde(default)]
    pub execution_session_id: Option<String>,
    #[serde(default)]
    pub execution_log_dir: Option<String>,
    pub status: PlanStatus,
}

/// Drift between the live workspace plan and the frozen snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDiff {
    /// Ids of tasks present only in the workspace.
    pub tasks_added: Vec<Value>,
    /// Ids of tasks present only in the frozen snapshot.
    pub tasks_removed: Vec<Value>,
    /// `{id, original, modified}` for tasks that changed.
    pub tasks_modified: Vec<Value>,
    /// `(added + removed + modified) / frozen tasks`, clamped to `[0, 1]`.
    pub divergence_score: f64,
}

/// One plan-and-execute session on disk.
#[derive(Debug, Clone)]
pub struct PlanSession {
    pub plan_id: String,
    pub plan_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub frozen_dir: PathBuf,
    metadata_file: PathBuf,
    execution_log_file: PathBuf,
    diff_file: PathBuf,
}

impl PlanSession {
    fn open(root: &Path, plan_id: &str) -> Self {
        let plan_dir = root.join(format!("plan_{}", plan_id));
        Self {
            plan_id: plan_id.to_string(),
            workspace_dir: plan_dir.join("workspace"),
            frozen_dir: plan_dir.join("frozen"),
            metadata_file: plan_dir.join("plan_metadata.json"),
            execution_log_file: plan_dir.join("execution_log.jsonl"),
            diff_file: plan_dir.join("plan_diff.json"),
            plan_dir,
        }
    }

    fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.workspace_dir)?;
        fs::create_dir_all(&self.frozen_dir)?;
        Ok(())
    }

    /// Load `plan_metadata.json`.
    pub fn load_metadata(&self) -> Result<PlanMetadata> {
        let raw = fs::read_to_string(&self.metadata_file)
            .map_err(|e| Error::other(format!("plan metadata not found: {}", e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist `plan_metadata.json`.
    pub fn save_metadata(&self, metadata: &PlanMetadata) -> Result<()> {
        fs::write(
            &self.metadata_file,
            serde_json::to_string_pretty(metadata)?,
        )?;
        Ok(())
    }

    /// Append one event to `execution_log.jsonl`.
    pub fn log_event(&self, event_type: &str, data: Value) -> Result<()> {
        let event = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event_type": event_type,
            "data": data,
        });
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.execution_log_file)?;
        writeln!(file, "{}", event)?;
        Ok(())
    }

    /// Parse all logged events, oldest first.
    pub fn read_events(&self) -> Result<Vec<Value>> {
        if !self.execution_log_file.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.execution_log_file)?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Error::from))
            .collect()
    }
}

/// Manages plan session creation and retrieval under one root directory.
pub struct PlanStorage {
    root: PathBuf,
}

impl Default for PlanStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanStorage {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_PLANS_DIR),
        }
    }

    /// Store sessions under a caller-chosen root instead of the default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Allocate a new plan session with empty `workspace/` and `frozen/`
    /// subtrees and `status = planning`.
    pub fn create(
        &self,
        planning_session_id: &str,
        planning_log_dir: &str,
    ) -> Result<PlanSession> {
        fs::create_dir_all(&self.root)?;
        let now = Utc::now();
        let plan_id = now.format("%Y%m%d_%H%M%S_%6f").to_string();

        let session = PlanSession::open(&self.root, &plan_id);
        session.create_dirs()?;

        let metadata = PlanMetadata {
            plan_id: plan_id.clone(),
            created_at: now.to_rfc3339(),
            planning_session_id: planning_session_id.to_string(),
            planning_log_dir: planning_log_dir.to_string(),
            execution_session_id: None,
            execution_log_dir: None,
            status: PlanStatus::Planning,
        };
        session.save_metadata(&metadata)?;
        session.log_event("plan_created", json!({"plan_id": plan_id}))?;

        log::info!("created plan session {}", session.plan_id);
        Ok(session)
    }

    /// The most recent plan session by timestamped directory name.
    pub fn latest(&self) -> Result<Option<PlanSession>> {
        if !self.root.exists() {
            return Ok(None);
        }
        let mut names: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("plan_"))
            .collect();
        names.sort();
        Ok(names
            .pop()
            .map(|name| PlanSession::open(&self.root, name.trim_start_matches("plan_"))))
    }

    /// Copy the planning agent's workspace in, rename `project_plan.json` to
    /// `plan.json`, then freeze an immutable snapshot. Sets `status = ready`.
    ///
    /// The frozen snapshot is built in a temporary directory and moved into
    /// place with a rename, so a crash never leaves a half-written `frozen/`.
    pub fn finalize(&self, session: &PlanSession, workspace_source: &Path) -> Result<()> {
        if workspace_source.exists() {
            copy_tree(workspace_source, &session.workspace_dir)?;
        }

        // The planning phase writes project_plan.json; execution expects
        // plan.json.
        let project_plan = session.workspace_dir.join("project_plan.json");
        if project_plan.exists() {
            fs::rename(&project_plan, session.workspace_dir.join("plan.json"))?;
        }

        let staging = session.plan_dir.join(".frozen_tmp");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        copy_tree(&session.workspace_dir, &staging)?;
        if session.frozen_dir.exists() {
            fs::remove_dir_all(&session.frozen_dir)?;
        }
        fs::rename(&staging, &session.frozen_dir)?;

        let mut metadata = session.load_metadata()?;
        metadata.status = PlanStatus::Ready;
        session.save_metadata(&metadata)?;

        let files: Vec<String> = collect_files(&session.workspace_dir)?
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        session.log_event("planning_finalized", json!({"workspace_files": files}))?;

        log::info!("finalized planning phase for {}", session.plan_id);
        Ok(())
    }

    /// Compare `workspace/plan.json` against `frozen/plan.json` and persist
    /// the result to `plan_diff.json`.
    pub fn diff(&self, session: &PlanSession) -> Result<PlanDiff> {
        let workspace_plan = session.workspace_dir.join("plan.json");
        let frozen_plan = session.frozen_dir.join("plan.json");
        if !workspace_plan.exists() || !frozen_plan.exists() {
            return Err(Error::other("plan files missing"));
        }

        let workspace: Value = serde_json::from_str(&fs::read_to_string(&workspace_plan)?)?;
        let frozen: Value = serde_json::from_str(&fs::read_to_string(&frozen_plan)?)?;

        let workspace_tasks = tasks_by_id(&workspace);
        let frozen_tasks = tasks_by_id(&frozen);

        let mut diff = PlanDiff {
            tasks_added: Vec::new(),
            tasks_removed: Vec::new(),
            tasks_modified: Vec::new(),
            divergence_score: 0.0,
        };

        for (key, (id, task)) in &workspace_tasks {
            match frozen_tasks.get(key) {
                None => diff.tasks_added.push(id.clone()),
                Some((_, frozen_task)) if frozen_task != task => {
                    diff.tasks_modified.push(json!({
                        "id": id,
                        "original": frozen_task,
                        "modified": task,
                    }));
                }
                Some(_) => {}
            }
        }
        for (key, (id, _)) in &frozen_tasks {
            if !workspace_tasks.contains_key(key) {
                diff.tasks_removed.push(id.clone());
            }
        }

        let total = frozen_tasks.len();
        if total > 0 {
            let changes =
                diff.tasks_added.len() + diff.tasks_removed.len() + diff.tasks_modified.len();
            diff.divergence_score = (changes as f64 / total as f64).min(1.0);
        }

        fs::write(&session.diff_file, serde_json::to_string_pretty(&diff)?)?;
        Ok(diff)
    }
}

/// Index a plan's `tasks` array by task id. Keys are the id's JSON text so
/// numeric and string ids both work; the original id value rides along.
fn tasks_by_id(plan: &Value) -> BTreeMap<String, (Value, Value)> {
    plan.get("tasks")
        .and_then(Value::as_array)
        .map(|tasks| {
            tasks
                .iter()
                .filter_map(|task| {
                    task.get("id")
                        .map(|id| (id.to_string(), (id.clone(), task.clone())))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            files.extend(collect_files(&entry.path())?);
        } else {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
