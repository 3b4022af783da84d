use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    #[default]
    Full,
    Differential,
}

/// A named backup job. Owned by the job store, read-only for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub name: String,
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub mode: BackupMode,
}

impl BackupJob {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        mode: BackupMode,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            mode,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    #[default]
    Inactive,
    Active,
    Completed,
    Error,
}

/// Live state of one run of a job.
///
/// Mutated only by the engine task driving the run; everyone else sees
/// clones pushed through the `ProgressRecorder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupState {
    pub job: BackupJob,
    pub status: BackupStatus,
    pub total_files: u64,
    pub files_remaining: u64,
    pub total_bytes: u64,
    pub bytes_remaining: u64,
    pub current_source: Option<PathBuf>,
    pub current_target: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    /// Set when the run was stopped. Status and counters keep their last values.
    #[serde(default)]
    pub cancelled: bool,
}

impl BackupState {
    pub fn new(job: BackupJob) -> Self {
        Self {
            job,
            status: BackupStatus::Inactive,
            total_files: 0,
            files_remaining: 0,
            total_bytes: 0,
            bytes_remaining: 0,
            current_source: None,
            current_target: None,
            updated_at: Utc::now(),
            error_message: None,
            cancelled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    /// Fraction of bytes done, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        1.0 - self.bytes_remaining as f64 / self.total_bytes as f64
    }

    /// Fix the denominators for this run. Called once, before the first file.
    pub(crate) fn begin(&mut self, total_files: u64, total_bytes: u64) {
        self.total_files = total_files;
        self.files_remaining = total_files;
        self.total_bytes = total_bytes;
        self.bytes_remaining = total_bytes;
        self.touch();
    }

    pub(crate) fn set_current(&mut self, source: &Path, target: &Path) {
        if self.status == BackupStatus::Inactive {
            self.status = BackupStatus::Active;
        }
        self.current_source = Some(source.to_path_buf());
        self.current_target = Some(target.to_path_buf());
        self.touch();
    }

    pub(crate) fn file_done(&mut self, size: u64) {
        self.files_remaining = self.files_remaining.saturating_sub(1);
        self.bytes_remaining = self.bytes_remaining.saturating_sub(size);
        self.touch();
    }

    /// Remember a failure. The last one wins.
    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.touch();
    }

    pub(crate) fn finish(&mut self) {
        self.status = if self.error_message.is_some() {
            BackupStatus::Error
        } else {
            BackupStatus::Completed
        };
        self.touch();
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.record_error(message);
        self.status = BackupStatus::Error;
    }

    pub(crate) fn cancel(&mut self) {
        self.cancelled = true;
        self.touch();
    }

    /// No further updates will follow: the run finished or was stopped.
    pub fn is_terminal(&self) -> bool {
        self.cancelled || matches!(self.status, BackupStatus::Completed | BackupStatus::Error)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
