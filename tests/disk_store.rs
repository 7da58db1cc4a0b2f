mod common;

use common::{clicks, page, ScriptedComputer, ScriptedReasoner};
use flowcap::recorder::StepRecord;
use flowcap::store::{CaptureStore, DiskStore};
use flowcap::{Agent, AgentConfig, AppProfile, ConstraintSet, Task, WorkflowDataset};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const APP: &str = "https://app.test";

#[tokio::test]
async fn writes_workflow_step_log_and_captures() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DiskStore::new(dir.path()));
    let computer = ScriptedComputer::new(
        page("https://app.test/home", "Home", "welcome"),
        vec![
            Ok(page("https://app.test/projects", "Projects", "list")),
            Ok(page("https://app.test/projects", "Projects", "list")),
            Ok(page("https://app.test/projects/new", "New project", "form")),
        ],
    );
    let cfg = AgentConfig { pause_between_tasks: Duration::ZERO, ..AgentConfig::default() };
    let mut agent = Agent::new(computer, ScriptedReasoner::new(clicks(3)), cfg).with_store(store.clone());
    let task = Task::new("create a project", AppProfile::new("app", "App", APP), ConstraintSet::for_domain(APP));

    let ds = agent.run_task(&task).await.unwrap();
    let task_dir = store.task_dir(&task.id);

    let saved: WorkflowDataset =
        serde_json::from_slice(&std::fs::read(task_dir.join("workflow.json")).unwrap()).unwrap();
    assert_eq!(saved.task_id, task.id);
    assert_eq!(saved.steps.len(), ds.steps.len());
    assert!(saved.success);

    let log = std::fs::read_to_string(task_dir.join("steps.jsonl")).unwrap();
    let logged: Vec<StepRecord> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(logged.iter().map(|s| s.index).collect::<Vec<_>>(), vec![1, 2]);

    for step in &ds.steps {
        let reference = step.snapshot.as_ref().unwrap().capture.as_ref().unwrap();
        assert!(reference.starts_with(&task.id));
        assert!(store.resolve(reference).is_file());
    }
    // initial capture, two accepted states; the unchanged candidate was removed
    let pngs = std::fs::read_dir(&task_dir)
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "png"))
        .count();
    assert_eq!(pngs, 3);
    assert!(task_dir.join("task.json").is_file());
}

#[tokio::test]
async fn discarding_a_missing_capture_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let store = DiskStore::new(dir.path());
    let reference = store.store_capture("t", 1, b"png").await.unwrap();
    assert_eq!(reference, "t/capture_0001.png");
    store.discard(&reference).await.unwrap();
    assert!(!store.resolve(&reference).exists());
    store.discard(&reference).await.unwrap();
}
