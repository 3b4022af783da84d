//! Drives one backup job from enumeration to terminal status.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::audit::{AuditEntry, AuditLog};
use super::control::{Checkpoint, JobControl};
use super::enumerator::{self, SourceFile};
use super::models::{BackupJob, BackupMode, BackupState};
use super::progress::ProgressRecorder;
use super::transfer::TransferUnit;
use crate::error::BackupError;

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every file was visited; status is `Completed` or `Error`.
    Finished(BackupState),
    /// Stopped at a checkpoint. The state is the last one recorded.
    Cancelled(BackupState),
    /// The run could not start, e.g. the source root is missing.
    Failed {
        state: BackupState,
        error: BackupError,
    },
}

impl RunOutcome {
    pub fn state(&self) -> &BackupState {
        match self {
            Self::Finished(state) | Self::Cancelled(state) => state,
            Self::Failed { state, .. } => state,
        }
    }

    pub fn into_state(self) -> BackupState {
        match self {
            Self::Finished(state) | Self::Cancelled(state) => state,
            Self::Failed { state, .. } => state,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Executes jobs. One runner is shared by every concurrent run.
pub struct JobRunner {
    transfer: Arc<dyn TransferUnit>,
    progress: ProgressRecorder,
    audit: Option<Arc<AuditLog>>,
}

impl JobRunner {
    pub fn new(
        transfer: Arc<dyn TransferUnit>,
        progress: ProgressRecorder,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        Self {
            transfer,
            progress,
            audit,
        }
    }

    pub fn progress(&self) -> &ProgressRecorder {
        &self.progress
    }

    pub async fn run(&self, job: BackupJob, control: Arc<JobControl>) -> RunOutcome {
        let mut state = BackupState::new(job.clone());
        self.record(&state).await;

        let scan = match enumerator::scan(&job.source).await {
            Ok(scan) => scan,
            Err(e) => {
                error!(job = %job.name, error = %e, "Cannot enumerate source");
                state.fail(e.to_string());
                self.record(&state).await;
                return RunOutcome::Failed { state, error: e };
            }
        };

        info!(
            job = %job.name,
            mode = ?job.mode,
            total_files = scan.files.len(),
            total_bytes = scan.total_bytes,
            "Scan complete"
        );

        state.begin(scan.files.len() as u64, scan.total_bytes);
        for e in &scan.errors {
            error!(job = %job.name, error = %e, "Part of the source could not be read");
            state.record_error(e.to_string());
        }
        self.record(&state).await;

        for file in &scan.files {
            if control.checkpoint().await == Checkpoint::Cancelled {
                info!(
                    job = %job.name,
                    files_remaining = state.files_remaining,
                    "Job cancelled"
                );
                state.cancel();
                self.record(&state).await;
                return RunOutcome::Cancelled(state);
            }

            self.process_file(&job, file, &mut state).await;
            state.file_done(file.size);
            self.record(&state).await;
        }

        state.finish();
        self.record(&state).await;

        match &state.error_message {
            Some(message) => warn!(job = %job.name, error = %message, "Job finished with errors"),
            None => info!(job = %job.name, "Job completed"),
        }

        RunOutcome::Finished(state)
    }

    async fn process_file(&self, job: &BackupJob, file: &SourceFile, state: &mut BackupState) {
        let relative = match file.path.strip_prefix(&job.source) {
            Ok(relative) => relative,
            Err(_) => {
                let e = BackupError::transfer(&file.path, "file is outside the source root");
                state.record_error(e.to_string());
                return;
            }
        };
        let target = job.target.join(relative);

        if job.mode == BackupMode::Differential && is_unchanged(file, &target).await {
            debug!(job = %job.name, file = %relative.display(), "Unchanged, skipping");
            return;
        }

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let e = BackupError::transfer(
                    &file.path,
                    format!("cannot create {}: {}", parent.display(), e),
                );
                self.file_failed(job, file, &target, e, state).await;
                return;
            }
        }

        state.set_current(&file.path, &target);
        self.record(state).await;

        debug!(job = %job.name, file = %relative.display(), size = file.size, "Copying file");

        match self.transfer.transfer(&file.path, &target).await {
            Ok(done) => {
                if let Some(audit) = &self.audit {
                    let entry = AuditEntry::success(
                        &job.name,
                        &file.path,
                        &target,
                        done.bytes,
                        done.copy_time,
                        done.encryption_time,
                    );
                    if let Err(e) = audit.append(&entry).await {
                        warn!(job = %job.name, error = %e, "Failed to write audit entry");
                    }
                }
            }
            Err(e) => self.file_failed(job, file, &target, e, state).await,
        }
    }

    async fn file_failed(
        &self,
        job: &BackupJob,
        file: &SourceFile,
        target: &Path,
        err: BackupError,
        state: &mut BackupState,
    ) {
        error!(job = %job.name, file = %file.path.display(), error = %err, "Failed to copy file");

        if let Some(audit) = &self.audit {
            let entry = AuditEntry::failure(&job.name, &file.path, target, file.size, &err);
            if let Err(e) = audit.append(&entry).await {
                warn!(job = %job.name, error = %e, "Failed to write audit entry");
            }
        }

        state.record_error(err.to_string());
    }

    async fn record(&self, state: &BackupState) {
        if let Err(e) = self.progress.update(state).await {
            warn!(job = %state.name(), error = %e, "Failed to persist progress");
        }
    }
}

/// Target exists with the same size and modification time as the source snapshot.
async fn is_unchanged(file: &SourceFile, target: &Path) -> bool {
    match tokio::fs::metadata(target).await {
        Ok(metadata) => {
            metadata.is_file()
                && metadata.len() == file.size
                && filetime::FileTime::from_last_modification_time(&metadata) == file.modified
        }
        Err(_) => false,
    }
}
