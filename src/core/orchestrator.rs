//! Runs selected jobs concurrently and routes pause/resume/stop to them.

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::business::BusinessSoftwareGate;
use super::control::{JobControl, JobRegistry};
use super::engine::{JobRunner, RunOutcome};
use super::models::{BackupJob, BackupState, BackupStatus};
use super::selection::parse_selection;
use super::transfer::{CopyTransfer, TransferUnit};
use crate::context::AppContext;
use crate::error::{BackupError, Result, join_error};

/// A started job: control surface plus the eventual outcome.
pub struct JobHandle {
    job: BackupJob,
    control: Arc<JobControl>,
    task: JoinHandle<RunOutcome>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn job(&self) -> &BackupJob {
        &self.job
    }

    pub fn control(&self) -> &Arc<JobControl> {
        &self.control
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut state = BackupState::new(self.job);
                state.fail(format!("job task failed: {}", e));
                RunOutcome::Failed {
                    state,
                    error: join_error(e),
                }
            }
        }
    }
}

/// Aggregate result of a batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub completed: usize,
    pub errored: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a RunOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome {
                RunOutcome::Cancelled(_) => summary.cancelled += 1,
                RunOutcome::Failed { .. } => summary.errored += 1,
                RunOutcome::Finished(state) if state.status == BackupStatus::Completed => {
                    summary.completed += 1
                }
                RunOutcome::Finished(_) => summary.errored += 1,
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.errored == 0 && self.cancelled == 0
    }
}

/// Unregisters a job when dropped: when its task ends, including by panic,
/// or when `start` is abandoned before the job was spawned.
struct Registration {
    registry: JobRegistry,
    control: Arc<JobControl>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.control);
    }
}

/// Owns the set of running jobs and the business software monitor.
///
/// Dropping the orchestrator cancels every job it started.
pub struct Orchestrator {
    ctx: AppContext,
    runner: Arc<JobRunner>,
    registry: JobRegistry,
    gate: Arc<BusinessSoftwareGate>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let transfer: Arc<dyn TransferUnit> = Arc::new(CopyTransfer::from_config(&ctx.config));
        let gate = BusinessSoftwareGate::new(ctx.config.business_process().map(str::to_string));
        Self::with_parts(ctx, transfer, gate)
    }

    pub fn with_parts(
        ctx: AppContext,
        transfer: Arc<dyn TransferUnit>,
        gate: BusinessSoftwareGate,
    ) -> Self {
        let runner = JobRunner::new(transfer, ctx.progress.clone(), ctx.audit.clone());
        Self {
            ctx,
            runner: Arc::new(runner),
            registry: JobRegistry::new(),
            gate: Arc::new(gate),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn running_jobs(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Resolve `selection` and start every selected job concurrently.
    ///
    /// Nothing starts if the selection is invalid or names a job that is
    /// already running.
    pub async fn start(&self, selection: &str) -> Result<Vec<JobHandle>> {
        let jobs = self.ctx.jobs.list().await?;
        let selected: Vec<BackupJob> = parse_selection(selection, jobs.len())?
            .into_iter()
            .map(|i| jobs[i].clone())
            .collect();

        let batch_started = Utc::now();
        let (registrations, was_idle) = self.register(&selected)?;

        // A fresh batch drops slots left by earlier runs. Slots of running jobs
        // and of anything that wrote after this batch began are kept.
        if was_idle {
            let registry = self.registry.clone();
            let kept = self
                .ctx
                .progress
                .retain(|state| {
                    registry.contains(state.name()) || state.updated_at >= batch_started
                })
                .await;
            if let Err(e) = kept {
                warn!(error = %e, "Failed to clear progress snapshot");
            }
        }

        self.ensure_monitor();
        let blocked = self.gate.poll().await;
        if blocked {
            info!("Business software is running, jobs start paused");
        }

        let handles = selected
            .into_iter()
            .zip(registrations)
            .map(|(job, registration)| {
                registration.control.set_business_paused(blocked);
                self.spawn(job, registration)
            })
            .collect();

        Ok(handles)
    }

    /// Start `selection` and wait for every job to end.
    pub async fn run(&self, selection: &str) -> Result<Vec<RunOutcome>> {
        let handles = self.start(selection).await?;
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.wait().await);
        }
        Ok(outcomes)
    }

    /// Pause the named job. Returns `false` if it is not running.
    pub fn pause(&self, name: &str) -> bool {
        self.with_job(name, |c| c.pause())
    }

    pub fn resume(&self, name: &str) -> bool {
        self.with_job(name, |c| c.resume())
    }

    pub fn stop(&self, name: &str) -> bool {
        self.with_job(name, |c| c.stop())
    }

    pub fn pause_all(&self) -> usize {
        self.with_all(|c| c.pause())
    }

    pub fn resume_all(&self) -> usize {
        self.with_all(|c| c.resume())
    }

    pub fn stop_all(&self) -> usize {
        self.with_all(|c| c.stop())
    }

    /// Stop every job and the business software monitor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn with_job(&self, name: &str, f: impl FnOnce(&JobControl)) -> bool {
        match self.registry.get(name) {
            Some(control) => {
                f(&*control);
                true
            }
            None => {
                debug!(job = %name, "Job is not running, ignoring");
                false
            }
        }
    }

    fn with_all(&self, f: impl Fn(&JobControl)) -> usize {
        let controls = self.registry.all();
        for control in &controls {
            f(&**control);
        }
        controls.len()
    }

    /// Register a control per job, all or nothing. Also reports whether no
    /// other job was running at that moment.
    fn register(&self, jobs: &[BackupJob]) -> Result<(Vec<Registration>, bool)> {
        let controls: Vec<Arc<JobControl>> = jobs
            .iter()
            .map(|job| Arc::new(JobControl::new(&job.name, self.shutdown.child_token())))
            .collect();

        let was_idle = self
            .registry
            .try_insert_all(&controls)
            .map_err(BackupError::AlreadyRunning)?;

        let registrations = controls
            .into_iter()
            .map(|control| Registration {
                registry: self.registry.clone(),
                control,
            })
            .collect();

        Ok((registrations, was_idle))
    }

    fn spawn(&self, job: BackupJob, registration: Registration) -> JobHandle {
        let runner = self.runner.clone();
        let control = registration.control.clone();
        let span = info_span!("job", name = %job.name);

        let task = tokio::spawn({
            let job = job.clone();
            let control = control.clone();
            async move {
                let _registration = registration;
                info!(source = %job.source.display(), target = %job.target.display(), "Job started");
                runner.run(job, control).await
            }
            .instrument(span)
        });

        JobHandle { job, control, task }
    }

    fn ensure_monitor(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.as_ref().is_some_and(|m| !m.is_finished()) {
            return;
        }

        *monitor = self.gate.clone().spawn_monitor(
            self.registry.clone(),
            self.ctx.config.business_poll_interval(),
            self.shutdown.child_token(),
        );
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
