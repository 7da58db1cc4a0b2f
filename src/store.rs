use crate::agent::AgentError;
use crate::recorder::StepRecord;
use crate::task::Task;
use crate::workflow::WorkflowDataset;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Sink for raw screenshots. Returns a reference that is unique per capture.
#[async_trait]
pub trait CaptureStore: Send + Sync {
    async fn store_capture(&self, task_id: &str, seq: u32, png: &[u8]) -> Result<String, AgentError>;

    async fn discard(&self, _reference: &str) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Append-only sink for the structured task log.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn write_task_start(&self, task: &Task) -> Result<(), AgentError>;
    /// Must not return before the step is durable.
    async fn write_step(&self, task_id: &str, step: &StepRecord) -> Result<(), AgentError>;
    async fn write_task_end(&self, dataset: &WorkflowDataset) -> Result<(), AgentError>;
}

pub struct NullStore;

#[async_trait]
impl CaptureStore for NullStore {
    async fn store_capture(&self, task_id: &str, seq: u32, _png: &[u8]) -> Result<String, AgentError> {
        Ok(capture_reference(task_id, seq))
    }
}

#[async_trait]
impl WorkflowStore for NullStore {
    async fn write_task_start(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_step(&self, _task_id: &str, _step: &StepRecord) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_task_end(&self, _dataset: &WorkflowDataset) -> Result<(), AgentError> {
        Ok(())
    }
}

fn capture_reference(task_id: &str, seq: u32) -> String {
    format!("{task_id}/capture_{seq:04}.png")
}

fn io_err(op: &str, e: std::io::Error) -> AgentError {
    AgentError::Storage(format!("{op}: {e}"))
}

/// Lays out one directory per task under `base_dir`:
/// `task.json`, `steps.jsonl`, `capture_NNNN.png` and finally `workflow.json`.
pub struct DiskStore {
    base_dir: PathBuf,
}

impl DiskStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.base_dir.join(reference)
    }

    async fn ensure_dir(&self, task_id: &str) -> Result<PathBuf, AgentError> {
        let dir = self.task_dir(task_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("create_dir", e))?;
        Ok(dir)
    }
}

#[async_trait]
impl CaptureStore for DiskStore {
    async fn store_capture(&self, task_id: &str, seq: u32, png: &[u8]) -> Result<String, AgentError> {
        self.ensure_dir(task_id).await?;
        let reference = capture_reference(task_id, seq);
        async_fs::write(self.resolve(&reference), png)
            .await
            .map_err(|e| io_err("write capture", e))?;
        Ok(reference)
    }

    async fn discard(&self, reference: &str) -> Result<(), AgentError> {
        match async_fs::remove_file(self.resolve(reference)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove capture", e)),
        }
    }
}

#[async_trait]
impl WorkflowStore for DiskStore {
    async fn write_task_start(&self, task: &Task) -> Result<(), AgentError> {
        let dir = self.ensure_dir(&task.id).await?;
        let body = serde_json::to_vec_pretty(task).map_err(|e| AgentError::Storage(e.to_string()))?;
        async_fs::write(dir.join("task.json"), body)
            .await
            .map_err(|e| io_err("write task", e))
    }

    async fn write_step(&self, task_id: &str, step: &StepRecord) -> Result<(), AgentError> {
        let dir = self.ensure_dir(task_id).await?;
        let mut line = serde_json::to_vec(step).map_err(|e| AgentError::Storage(e.to_string()))?;
        line.push(b'\n');
        let mut file = async_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("steps.jsonl"))
            .await
            .map_err(|e| io_err("open step log", e))?;
        file.write_all(&line).await.map_err(|e| io_err("append step", e))?;
        file.sync_data().await.map_err(|e| io_err("sync step log", e))
    }

    async fn write_task_end(&self, dataset: &WorkflowDataset) -> Result<(), AgentError> {
        let dir = self.ensure_dir(&dataset.task_id).await?;
        let body = serde_json::to_vec_pretty(dataset).map_err(|e| AgentError::Storage(e.to_string()))?;
        let path = dir.join("workflow.json");
        async_fs::write(&path, body)
            .await
            .map_err(|e| io_err("write workflow", e))?;
        info!(path = %path.display(), steps = dataset.steps.len(), "workflow saved");
        Ok(())
    }
}

/// Keeps everything in memory; handy for tests and dry runs.
#[derive(Default)]
pub struct InMemoryStore {
    captures: Mutex<BTreeMap<String, usize>>,
    steps: Mutex<Vec<(String, StepRecord)>>,
    datasets: Mutex<Vec<WorkflowDataset>>,
}

impl InMemoryStore {
    /// Live capture references mapped to their byte length.
    pub fn captures(&self) -> BTreeMap<String, usize> {
        self.captures.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn steps(&self) -> Vec<(String, StepRecord)> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn datasets(&self) -> Vec<WorkflowDataset> {
        self.datasets.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> AgentError {
    AgentError::Storage("store lock poisoned".into())
}

#[async_trait]
impl CaptureStore for InMemoryStore {
    async fn store_capture(&self, task_id: &str, seq: u32, png: &[u8]) -> Result<String, AgentError> {
        let reference = capture_reference(task_id, seq);
        self.captures.lock().map_err(poisoned)?.insert(reference.clone(), png.len());
        Ok(reference)
    }

    async fn discard(&self, reference: &str) -> Result<(), AgentError> {
        self.captures.lock().map_err(poisoned)?.remove(reference);
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn write_task_start(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_step(&self, task_id: &str, step: &StepRecord) -> Result<(), AgentError> {
        self.steps
            .lock()
            .map_err(poisoned)?
            .push((task_id.to_string(), step.clone()));
        Ok(())
    }

    async fn write_task_end(&self, dataset: &WorkflowDataset) -> Result<(), AgentError> {
        self.datasets.lock().map_err(poisoned)?.push(dataset.clone());
        Ok(())
    }
}
