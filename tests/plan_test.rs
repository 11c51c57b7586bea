//! Plan-and-execute session store: lifecycle, freezing, drift detection.

use massgen::{PlanStatus, PlanStorage};
use serde_json::json;
use std::fs;
use std::path::Path;

fn write_plan(dir: &Path, name: &str, tasks: serde_json::Value) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join(name),
        serde_json::to_string(&json!({"tasks": tasks})).unwrap(),
    )
    .unwrap();
}

/// Full lifecycle: create → finalize → execute with drift.
///
/// Scenario (plan drift): workspace tasks {1,2,3}, frozen {1,2}. Expected:
/// `tasks_added = [3]`, nothing removed or modified, divergence 0.5.
#[test]
fn test_plan_lifecycle_and_drift() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = PlanStorage::with_root(tmp.path().join("plans"));

    let session = storage.create("planning-session-1", "/logs/run1").unwrap();
    assert_eq!(session.load_metadata().unwrap().status, PlanStatus::Planning);

    // The planning agent produced a two-task project plan.
    let agent_workspace = tmp.path().join("agent_ws");
    write_plan(
        &agent_workspace,
        "project_plan.json",
        json!([
            {"id": 1, "title": "set up repo"},
            {"id": 2, "title": "write parser"}
        ]),
    );
    storage.finalize(&session, &agent_workspace).unwrap();
    assert_eq!(session.load_metadata().unwrap().status, PlanStatus::Ready);

    // Directory layout is exactly the documented shape.
    assert!(session.workspace_dir.join("plan.json").exists());
    assert!(session.frozen_dir.join("plan.json").exists());
    assert!(session.plan_dir.join("plan_metadata.json").exists());
    assert!(session.plan_dir.join("execution_log.jsonl").exists());

    // Unchanged workspace: zero drift.
    let diff = storage.diff(&session).unwrap();
    assert_eq!(diff.divergence_score, 0.0);
    assert!(diff.tasks_added.is_empty());

    // Execution adds task 3 to the live plan.
    write_plan(
        &session.workspace_dir,
        "plan.json",
        json!([
            {"id": 1, "title": "set up repo"},
            {"id": 2, "title": "write parser"},
            {"id": 3, "title": "surprise requirement"}
        ]),
    );
    let diff = storage.diff(&session).unwrap();
    assert_eq!(diff.tasks_added, vec![json!(3)]);
    assert!(diff.tasks_removed.is_empty());
    assert!(diff.tasks_modified.is_empty());
    assert_eq!(diff.divergence_score, 0.5);
}

/// The frozen snapshot is immutable once written: re-running diff never
/// mutates it, and drift is always measured against the finalize-time copy.
#[test]
fn test_frozen_snapshot_is_stable() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = PlanStorage::with_root(tmp.path().join("plans"));
    let session = storage.create("s", "/logs").unwrap();

    let agent_workspace = tmp.path().join("agent_ws");
    write_plan(&agent_workspace, "project_plan.json", json!([{"id": 1}]));
    storage.finalize(&session, &agent_workspace).unwrap();

    let frozen_before = fs::read_to_string(session.frozen_dir.join("plan.json")).unwrap();

    write_plan(
        &session.workspace_dir,
        "plan.json",
        json!([{"id": 1, "title": "rewritten"}]),
    );
    storage.diff(&session).unwrap();
    storage.diff(&session).unwrap();

    let frozen_after = fs::read_to_string(session.frozen_dir.join("plan.json")).unwrap();
    assert_eq!(frozen_before, frozen_after);
}

/// Property: divergence stays inside [0, 1] across add/remove/modify mixes,
/// including complete rewrites.
#[test]
fn test_divergence_score_range() {
    let cases = vec![
        (json!([{"id": 1}, {"id": 2}]), json!([{"id": 1}, {"id": 2}])),
        (json!([{"id": 1}]), json!([{"id": 2}])),
        (json!([{"id": 1}]), json!([{"id": 2}, {"id": 3}, {"id": 4}])),
        (json!([{"id": 1}, {"id": 2}, {"id": 3}]), json!([])),
        (
            json!([{"id": 1, "v": 1}, {"id": 2}]),
            json!([{"id": 1, "v": 2}, {"id": 3}]),
        ),
    ];

    for (frozen_tasks, workspace_tasks) in cases {
        let tmp = tempfile::tempdir().unwrap();
        let storage = PlanStorage::with_root(tmp.path().join("plans"));
        let session = storage.create("s", "/logs").unwrap();

        let agent_workspace = tmp.path().join("agent_ws");
        write_plan(&agent_workspace, "project_plan.json", frozen_tasks);
        storage.finalize(&session, &agent_workspace).unwrap();
        write_plan(&session.workspace_dir, "plan.json", workspace_tasks);

        let diff = storage.diff(&session).unwrap();
        assert!(
            (0.0..=1.0).contains(&diff.divergence_score),
            "score {} out of range",
            diff.divergence_score
        );
    }
}

/// Execution log lines are append-only JSON objects with the documented
/// shape.
#[test]
fn test_execution_log_shape() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = PlanStorage::with_root(tmp.path().join("plans"));
    let session = storage.create("s", "/logs").unwrap();

    session
        .log_event("task_started", json!({"task_id": 2, "agent": "executor"}))
        .unwrap();

    let raw = fs::read_to_string(session.plan_dir.join("execution_log.jsonl")).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2); // plan_created + task_started

    for line in lines {
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(event["timestamp"].is_string());
        assert!(event["event_type"].is_string());
        assert!(event["data"].is_object());
    }
}

/// `latest` resolves the newest session by directory timestamp.
#[test]
fn test_latest_plan_session() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = PlanStorage::with_root(tmp.path().join("plans"));
    assert!(storage.latest().unwrap().is_none());

    storage.create("first", "/logs").unwrap();
    let newest = storage.create("second", "/logs").unwrap();

    let latest = storage.latest().unwrap().unwrap();
    assert_eq!(latest.plan_id, newest.plan_id);
    assert_eq!(
        latest.load_metadata().unwrap().planning_session_id,
        "second"
    );
}
