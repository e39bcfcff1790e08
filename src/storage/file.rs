//! JSON file storage implementation.
//!
//! Keeps the whole job table and run history in one JSON document. Nothing is
//! cached: every operation reads the document from disk, so a scheduler and
//! CLI commands in other processes see each other's changes. Mutations hold
//! an exclusive `flock` on a sidecar `.lock` file for the whole
//! read-modify-write and replace the document through a temporary file and
//! an atomic rename. A failed write leaves the previous document in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{RunStatus, Storage, StorageError, StoredRun, next_run_lapsed};
use crate::core::job::Job;
use crate::core::types::{JobName, RunId};
use crate::scheduler::lock::lock_exclusive;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    runs: Vec<StoredRun>,
}

impl Document {
    fn job(&self, name: &JobName) -> Result<&Job, StorageError> {
        self.jobs
            .iter()
            .find(|j| &j.name == name)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))
    }

    fn job_mut(&mut self, name: &JobName) -> Result<&mut Job, StorageError> {
        self.jobs
            .iter_mut()
            .find(|j| &j.name == name)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))
    }

    fn run_mut(&mut self, id: &RunId) -> Result<&mut StoredRun, StorageError> {
        self.runs
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))
    }
}

/// File-backed storage.
pub struct FileStorage {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes writers in this process before they queue on the OS lock.
    writer: Mutex<()>,
}

impl FileStorage {
    /// Open (or create) the document at `path`.
    ///
    /// An existing document is parsed once here so a corrupt file fails fast.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Other(format!("{}: {}", parent.display(), e)))?;
        }

        let storage = Self {
            lock_path: sibling(&path, ".lock"),
            path,
            writer: Mutex::new(()),
        };
        storage.load().await?;
        Ok(storage)
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Document, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Document::default()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                StorageError::SerializationError(format!("{}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(StorageError::Other(format!("{}: {}", self.path.display(), e))),
        }
    }

    /// Read-modify-write under the process and file locks.
    ///
    /// The document is only written when `change` succeeds; the file on disk
    /// is the only copy, so a failed write leaves nothing behind.
    async fn update<T, F>(&self, change: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Document) -> Result<Option<T>, StorageError>,
        T: Default,
    {
        let _writer = self.writer.lock().await;
        let lock_path = self.lock_path.clone();
        let _file_lock = tokio::task::spawn_blocking(move || lock_exclusive(&lock_path))
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?
            .map_err(|e| StorageError::Other(format!("{}: {}", self.lock_path.display(), e)))?;

        let mut document = self.load().await?;
        match change(&mut document)? {
            Some(value) => {
                self.persist(&mut document).await?;
                Ok(value)
            }
            None => Ok(T::default()),
        }
    }

    async fn persist(&self, document: &mut Document) -> Result<(), StorageError> {
        document.version = FORMAT_VERSION;
        let contents = serde_json::to_vec_pretty(document)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let tmp = sibling(&self.path, ".tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StorageError::Other(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::Other(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl Storage for FileStorage {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        self.update(|doc| {
            if doc.jobs.iter().any(|j| j.name == job.name) {
                return Err(StorageError::DuplicateKey(format!("job: {}", job.name)));
            }
            doc.jobs.push(job);
            Ok(Some(()))
        })
        .await
    }

    async fn get_job(&self, name: &JobName) -> Result<Job, StorageError> {
        self.load().await?.job(name).cloned()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let mut jobs = self.load().await?.jobs;
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(jobs)
    }

    async fn delete_job(&self, name: &JobName) -> Result<(), StorageError> {
        self.update(|doc| {
            let before = doc.jobs.len();
            doc.jobs.retain(|j| &j.name != name);
            if doc.jobs.len() == before {
                return Err(StorageError::NotFound(format!("job: {}", name)));
            }
            Ok(Some(()))
        })
        .await
    }

    async fn set_enabled(
        &self,
        name: &JobName,
        enabled: bool,
        lapsed_next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.update(|doc| {
            let job = doc.job_mut(name)?;
            job.enabled = enabled;
            job.updated_at = now;
            if enabled && lapsed_next.is_some() && next_run_lapsed(job.next_run_at, now) {
                job.next_run_at = lapsed_next;
            }
            Ok(Some(()))
        })
        .await
    }

    async fn record_outcome(
        &self,
        name: &JobName,
        last_run_at: DateTime<Utc>,
        last_status: RunStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        self.update(|doc| {
            let job = doc.job_mut(name)?;
            job.last_run_at = Some(last_run_at);
            job.last_status = Some(last_status);
            job.next_run_at = next_run_at;
            Ok(Some(()))
        })
        .await
    }

    async fn update_next_run(
        &self,
        name: &JobName,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        self.update(|doc| {
            doc.job_mut(name)?.next_run_at = next_run_at;
            Ok(Some(()))
        })
        .await
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let mut due: Vec<Job> = self
            .load()
            .await?
            .jobs
            .into_iter()
            .filter(|job| job.enabled && job.next_run_at.is_some_and(|next| next <= now))
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(due)
    }

    async fn save_run(&self, run: StoredRun) -> Result<(), StorageError> {
        self.update(|doc| {
            if doc.runs.iter().any(|r| r.id == run.id) {
                return Err(StorageError::DuplicateKey(format!("run: {}", run.id)));
            }
            doc.runs.push(run);
            Ok(Some(()))
        })
        .await
    }

    async fn get_run(&self, id: &RunId) -> Result<StoredRun, StorageError> {
        self.load()
            .await?
            .runs
            .into_iter()
            .find(|r| &r.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))
    }

    async fn list_runs(
        &self,
        job: Option<&JobName>,
        limit: usize,
    ) -> Result<Vec<StoredRun>, StorageError> {
        let mut runs: Vec<StoredRun> = self
            .load()
            .await?
            .runs
            .into_iter()
            .filter(|r| job.is_none_or(|name| &r.job_name == name))
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn update_run(&self, run: StoredRun) -> Result<(), StorageError> {
        self.update(|doc| {
            let id = run.id.clone();
            *doc.run_mut(&id)? = run;
            Ok(Some(()))
        })
        .await
    }

    async fn get_incomplete_runs(&self) -> Result<Vec<StoredRun>, StorageError> {
        Ok(self
            .load()
            .await?
            .runs
            .into_iter()
            .filter(|r| r.status == RunStatus::Running)
            .collect())
    }

    async fn mark_run_interrupted(
        &self,
        id: &RunId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.update(|doc| {
            doc.run_mut(id)?
                .mark_interrupted(at, "scheduler stopped before the run finished");
            Ok(Some(()))
        })
        .await
    }

    async fn prune_runs(&self, keep: usize) -> Result<usize, StorageError> {
        self.update(|doc| {
            if doc.runs.len() <= keep {
                return Ok(None);
            }
            doc.runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
            let excess = doc.runs.len() - keep;
            doc.runs.drain(..excess);
            Ok(Some(excess))
        })
        .await
    }
}
