//! Automatic pause while a configured "business software" process runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::control::JobRegistry;
use crate::logging::LogThrottle;

/// Answers "is a process with this name running?".
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, name: &str) -> bool;
}

/// Scans `/proc/<pid>/comm` and the first `cmdline` argument.
#[derive(Debug, Clone)]
pub struct ProcFsProbe {
    root: PathBuf,
}

impl Default for ProcFsProbe {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFsProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessProbe for ProcFsProbe {
    fn is_running(&self, name: &str) -> bool {
        let wanted = normalize_process_name(name);
        if wanted.is_empty() {
            return false;
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cannot list processes");
                return false;
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()))
            })
            .any(|entry| process_names(&entry.path()).any(|n| n == wanted))
    }
}

/// Candidate names for one `/proc/<pid>` directory.
fn process_names(dir: &Path) -> impl Iterator<Item = String> {
    let comm = fs::read_to_string(dir.join("comm"))
        .ok()
        .map(|s| normalize_process_name(&s));

    // comm is truncated to 15 bytes, argv[0] is not.
    let argv0 = fs::read(dir.join("cmdline")).ok().and_then(|raw| {
        let first = raw.split(|b| *b == 0).next()?;
        let first = String::from_utf8_lossy(first);
        let base = Path::new(&*first).file_name()?.to_string_lossy().into_owned();
        Some(normalize_process_name(&base))
    });

    comm.into_iter().chain(argv0).filter(|n| !n.is_empty())
}

/// Case-insensitive, without a trailing `.exe`.
fn normalize_process_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    name.strip_suffix(".exe").map(str::to_string).unwrap_or(name)
}

/// Decides whether jobs must be held because business software is running.
pub struct BusinessSoftwareGate {
    process_name: Option<String>,
    probe: Arc<dyn ProcessProbe>,
    blocked: AtomicBool,
}

impl BusinessSoftwareGate {
    pub fn new(process_name: Option<String>) -> Self {
        Self::with_probe(process_name, Arc::new(ProcFsProbe::default()))
    }

    pub fn with_probe(process_name: Option<String>, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            process_name: process_name.filter(|n| !n.trim().is_empty()),
            probe,
            blocked: AtomicBool::new(false),
        }
    }

    pub fn process_name(&self) -> Option<&str> {
        self.process_name.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.process_name.is_some()
    }

    /// Result of the most recent poll.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Query the probe now and remember the answer. Always `false` when disabled.
    pub async fn poll(&self) -> bool {
        let blocked = match &self.process_name {
            None => false,
            Some(name) => {
                let probe = self.probe.clone();
                let name = name.clone();
                tokio::task::spawn_blocking(move || probe.is_running(&name))
                    .await
                    .unwrap_or(false)
            }
        };
        self.blocked.store(blocked, Ordering::SeqCst);
        blocked
    }

    /// Poll once and push the result into every running job.
    pub async fn tick(&self, registry: &JobRegistry) -> bool {
        let blocked = self.poll().await;
        for control in registry.all() {
            control.set_business_paused(blocked);
        }
        blocked
    }

    /// Run `tick` every `interval` until `shutdown` fires.
    ///
    /// Returns `None` when no business software is configured.
    pub fn spawn_monitor(
        self: Arc<Self>,
        registry: JobRegistry,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let name = self.process_name.clone()?;
        let span = info_span!("business_gate", process = %name);

        Some(tokio::spawn(
            async move {
                info!(interval_ms = interval.as_millis() as u64, "Business software monitor started");
                let throttle = LogThrottle::new(Duration::from_secs(60));
                let mut was_blocked = self.is_blocked();
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let blocked = self.tick(&registry).await;
                    if blocked != was_blocked {
                        if blocked {
                            info!(jobs = registry.len(), "Business software detected, pausing jobs");
                        } else {
                            info!(jobs = registry.len(), "Business software gone, resuming jobs");
                        }
                        throttle.reset();
                        was_blocked = blocked;
                    } else if blocked && !registry.is_empty() && throttle.should_log() {
                        debug!(jobs = registry.len(), "Jobs still held by business software");
                    }
                }

                debug!("Business software monitor stopped");
            }
            .instrument(span),
        ))
    }
}
