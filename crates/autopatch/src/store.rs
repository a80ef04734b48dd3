//! Run persistence.
//!
//! [`RunStore`] is the seam between the workflow and wherever runs live.
//! Two implementations ship here: an in-memory map for tests and embedding,
//! and a directory of pretty-printed JSON files (one per run).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::run::{Run, RunEvent, Step, StepKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Run already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid run id: {0}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> StoreResult<()>;
    async fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>>;
    async fn update_run(&self, run: &Run) -> StoreResult<()>;
    /// Append a step; the store assigns the next step number (from 1).
    async fn append_step(&self, run_id: &str, kind: StepKind, content: &str) -> StoreResult<Step>;
    async fn get_step(&self, run_id: &str, number: u32) -> StoreResult<Option<Step>>;
    async fn steps(&self, run_id: &str) -> StoreResult<Vec<Step>>;
    async fn append_event(&self, event: RunEvent) -> StoreResult<()>;
    async fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>>;
}

/// Everything stored for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    run: Run,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    events: Vec<RunEvent>,
}

impl RunRecord {
    fn push_step(&mut self, kind: StepKind, content: &str) -> Step {
        let step = Step {
            number: self.steps.len() as u32 + 1,
            kind,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.steps.push(step.clone());
        step
    }
}

// ── In-memory ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    records: RwLock<HashMap<String, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &Run) -> StoreResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id.clone()));
        }
        records.insert(
            run.id.clone(),
            RunRecord {
                run: run.clone(),
                steps: Vec::new(),
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        Ok(self.records.read().await.get(run_id).map(|r| r.run.clone()))
    }

    async fn update_run(&self, run: &Run) -> StoreResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::NotFound(run.id.clone()))?;
        record.run = run.clone();
        Ok(())
    }

    async fn append_step(&self, run_id: &str, kind: StepKind, content: &str) -> StoreResult<Step> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        Ok(record.push_step(kind, content))
    }

    async fn get_step(&self, run_id: &str, number: u32) -> StoreResult<Option<Step>> {
        Ok(self
            .records
            .read()
            .await
            .get(run_id)
            .and_then(|r| r.steps.iter().find(|s| s.number == number).cloned()))
    }

    async fn steps(&self, run_id: &str) -> StoreResult<Vec<Step>> {
        Ok(self
            .records
            .read()
            .await
            .get(run_id)
            .map(|r| r.steps.clone())
            .unwrap_or_default())
    }

    async fn append_event(&self, event: RunEvent) -> StoreResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&event.run_id)
            .ok_or_else(|| StoreError::NotFound(event.run_id.clone()))?;
        record.events.push(event);
        Ok(())
    }

    async fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>> {
        Ok(self
            .records
            .read()
            .await
            .get(run_id)
            .map(|r| r.events.clone())
            .unwrap_or_default())
    }
}

// ── JSON files ─────────────────────────────────────────────────────────────

/// Stores each run as `<dir>/<run_id>.json`.
#[derive(Debug)]
pub struct JsonRunStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles across tasks.
    lock: Mutex<()>,
}

impl JsonRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> StoreResult<PathBuf> {
        let well_formed = !run_id.is_empty()
            && !run_id.starts_with('.')
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !well_formed {
            return Err(StoreError::InvalidId(run_id.to_string()));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }

    async fn load(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        let path = self.path_for(run_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, record: &RunRecord) -> StoreResult<()> {
        let path = self.path_for(&record.run.id)?;
        let json = serde_json::to_string_pretty(record)?;
        // Write-then-rename so a crash never leaves a half-written file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(run_id = %record.run.id, "Run record saved");
        Ok(())
    }

    async fn modify<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunRecord) -> T + Send,
    ) -> StoreResult<T> {
        let _guard = self.lock.lock().await;
        let mut record = self
            .load(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let out = f(&mut record);
        self.save(&record).await?;
        Ok(out)
    }
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn create_run(&self, run: &Run) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        if self.load(&run.id).await?.is_some() {
            return Err(StoreError::AlreadyExists(run.id.clone()));
        }
        self.save(&RunRecord {
            run: run.clone(),
            steps: Vec::new(),
            events: Vec::new(),
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        Ok(self.load(run_id).await?.map(|r| r.run))
    }

    async fn update_run(&self, run: &Run) -> StoreResult<()> {
        let run_id = run.id.clone();
        let run = run.clone();
        self.modify(&run_id, move |record| record.run = run).await
    }

    async fn append_step(&self, run_id: &str, kind: StepKind, content: &str) -> StoreResult<Step> {
        self.modify(run_id, |record| record.push_step(kind, content))
            .await
    }

    async fn get_step(&self, run_id: &str, number: u32) -> StoreResult<Option<Step>> {
        Ok(self
            .load(run_id)
            .await?
            .and_then(|r| r.steps.into_iter().find(|s| s.number == number)))
    }

    async fn steps(&self, run_id: &str) -> StoreResult<Vec<Step>> {
        Ok(self.load(run_id).await?.map(|r| r.steps).unwrap_or_default())
    }

    async fn append_event(&self, event: RunEvent) -> StoreResult<()> {
        let run_id = event.run_id.clone();
        self.modify(&run_id, move |record| record.events.push(event))
            .await
    }

    async fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>> {
        Ok(self.load(run_id).await?.map(|r| r.events).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn RunStore) {
        let run = Run::new("run-1", "add route", "/repo");
        store.create_run(&run).await.unwrap();
        assert!(matches!(
            store.create_run(&run).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let s1 = store.append_step("run-1", StepKind::Plan, "plan").await.unwrap();
        let s2 = store
            .append_step("run-1", StepKind::Implement, "--- a/x\n+++ b/x\n")
            .await
            .unwrap();
        assert_eq!((s1.number, s2.number), (1, 2));
        assert_eq!(
            store.get_step("run-1", 2).await.unwrap().unwrap().kind,
            StepKind::Implement
        );
        assert!(store.get_step("run-1", 9).await.unwrap().is_none());
        assert_eq!(store.steps("run-1").await.unwrap().len(), 2);

        store
            .append_event(RunEvent::new("run-1", "phase", "planning"))
            .await
            .unwrap();
        assert_eq!(store.events("run-1").await.unwrap().len(), 1);

        let mut updated = store.get_run("run-1").await.unwrap().unwrap();
        updated.fix_attempts = 2;
        store.update_run(&updated).await.unwrap();
        assert_eq!(store.get_run("run-1").await.unwrap().unwrap().fix_attempts, 2);

        assert!(store.get_run("missing").await.unwrap().is_none());
        assert!(matches!(
            store.append_step("missing", StepKind::Plan, "x").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn test_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::new(dir.path().join("runs")).unwrap();
        exercise(&store).await;
        assert!(dir.path().join("runs/run-1.json").exists());

        // A second store over the same directory sees the same data.
        let reopened = JsonRunStore::new(dir.path().join("runs")).unwrap();
        assert_eq!(reopened.steps("run-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_json_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.get_run("../etc/passwd").await,
            Err(StoreError::InvalidId(_))
        ));
    }
}
