use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::BackupJob;
use crate::error::{BackupError, Result};

/// JSON-backed list of backup jobs, in user-defined order.
#[derive(Clone)]
pub struct JobStore {
    path: Arc<PathBuf>,
    capacity: usize,
    lock: Arc<Mutex<()>>,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: Arc::new(path.into()),
            capacity,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Result<Vec<BackupJob>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn get(&self, name: &str) -> Result<BackupJob> {
        self.list()
            .await?
            .into_iter()
            .find(|j| j.name == name)
            .ok_or_else(|| BackupError::JobNotFound(name.to_string()))
    }

    pub async fn add(&self, job: BackupJob) -> Result<()> {
        validate(&job)?;

        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await?;

        if jobs.iter().any(|j| j.name == job.name) {
            return Err(BackupError::DuplicateJob(job.name));
        }
        if jobs.len() >= self.capacity {
            return Err(BackupError::JobLimitReached(self.capacity));
        }

        debug!(job = %job.name, "Adding job");
        jobs.push(job);
        self.write(&jobs).await
    }

    /// Replace the job called `name`, keeping its position in the list.
    pub async fn update(&self, name: &str, job: BackupJob) -> Result<()> {
        validate(&job)?;

        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await?;

        if job.name != name && jobs.iter().any(|j| j.name == job.name) {
            return Err(BackupError::DuplicateJob(job.name));
        }

        let slot = jobs
            .iter_mut()
            .find(|j| j.name == name)
            .ok_or_else(|| BackupError::JobNotFound(name.to_string()))?;
        *slot = job;

        self.write(&jobs).await
    }

    pub async fn remove(&self, name: &str) -> Result<BackupJob> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await?;

        let index = jobs
            .iter()
            .position(|j| j.name == name)
            .ok_or_else(|| BackupError::JobNotFound(name.to_string()))?;
        let removed = jobs.remove(index);

        self.write(&jobs).await?;
        Ok(removed)
    }

    async fn read(&self) -> Result<Vec<BackupJob>> {
        match tokio::fs::read(self.path.as_path()).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, jobs: &[BackupJob]) -> Result<()> {
        let json = serde_json::to_vec_pretty(jobs)?;
        super::write_atomic(&self.path, &json).await?;
        Ok(())
    }
}

fn validate(job: &BackupJob) -> Result<()> {
    if job.name.trim().is_empty() {
        return Err(BackupError::InvalidJob("name must not be empty".into()));
    }
    if job.source.as_os_str().is_empty() || job.target.as_os_str().is_empty() {
        return Err(BackupError::InvalidJob(format!(
            "job `{}` needs both a source and a target",
            job.name
        )));
    }
    Ok(())
}
