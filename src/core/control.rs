//! Per-job pause and cancellation scope.
//!
//! A job is blocked while either of its two pause causes is set: a manual
//! pause from the user, or an automatic pause from the business software
//! gate. The engine only looks at the gate between files.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
struct PauseCauses {
    manual: bool,
    business: bool,
}

impl PauseCauses {
    fn is_open(&self) -> bool {
        !self.manual && !self.business
    }
}

/// What the engine should do at a per-file checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Cancelled,
}

/// Control handle for one running job.
pub struct JobControl {
    name: String,
    cancel: CancellationToken,
    causes: Mutex<PauseCauses>,
    /// `true` while the gate is open.
    gate: watch::Sender<bool>,
}

impl JobControl {
    pub fn new(name: impl Into<String>, cancel: CancellationToken) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            name: name.into(),
            cancel,
            causes: Mutex::new(PauseCauses::default()),
            gate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pause(&self) {
        let mut causes = self.causes();
        causes.manual = true;
        self.recompute(&causes);
    }

    pub fn resume(&self) {
        let mut causes = self.causes();
        causes.manual = false;
        self.recompute(&causes);
    }

    pub fn set_business_paused(&self, paused: bool) {
        let mut causes = self.causes();
        causes.business = paused;
        self.recompute(&causes);
    }

    pub fn stop(&self) {
        debug!(job = %self.name, "Cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        !*self.gate.borrow()
    }

    pub fn is_manually_paused(&self) -> bool {
        self.causes().manual
    }

    pub fn is_business_paused(&self) -> bool {
        self.causes().business
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until the gate is open or the job is cancelled.
    ///
    /// Cancellation wins over a paused gate, so a paused job can still be stopped.
    pub async fn checkpoint(&self) -> Checkpoint {
        if self.cancel.is_cancelled() {
            return Checkpoint::Cancelled;
        }

        let mut open = self.gate.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Checkpoint::Cancelled,
            _ = open.wait_for(|open| *open) => {
                if self.cancel.is_cancelled() {
                    Checkpoint::Cancelled
                } else {
                    Checkpoint::Continue
                }
            }
        }
    }

    fn causes(&self) -> MutexGuard<'_, PauseCauses> {
        self.causes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the causes lock held so gate and causes agree.
    fn recompute(&self, causes: &PauseCauses) {
        let open = causes.is_open();
        let changed = self.gate.send_if_modified(|current| {
            if *current == open {
                false
            } else {
                *current = open;
                true
            }
        });

        if changed {
            debug!(
                job = %self.name,
                manual = causes.manual,
                business = causes.business,
                open,
                "Pause gate changed"
            );
        }
    }
}

/// Running jobs, keyed by job name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<JobControl>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<JobControl>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `control` unless a job with the same name is already present.
    pub fn try_insert(&self, control: Arc<JobControl>) -> bool {
        self.try_insert_all(std::slice::from_ref(&control)).is_ok()
    }

    /// Register every control or none of them, under one lock.
    ///
    /// On success, returns whether the registry was empty beforehand. On a
    /// name clash, returns the name of the job that is already running.
    pub fn try_insert_all(&self, controls: &[Arc<JobControl>]) -> Result<bool, String> {
        let mut map = self.map();
        if let Some(taken) = controls.iter().find(|c| map.contains_key(c.name())) {
            return Err(taken.name().to_string());
        }

        let was_empty = map.is_empty();
        for control in controls {
            map.insert(control.name().to_string(), control.clone());
        }
        Ok(was_empty)
    }

    /// Remove the entry for `control`, but only if it is still the registered one.
    pub fn remove(&self, control: &Arc<JobControl>) {
        let mut map = self.map();
        if map
            .get(control.name())
            .is_some_and(|current| Arc::ptr_eq(current, control))
        {
            map.remove(control.name());
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobControl>> {
        self.map().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map().contains_key(name)
    }

    pub fn all(&self) -> Vec<Arc<JobControl>> {
        self.map().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.map().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
