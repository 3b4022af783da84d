use async_trait::async_trait;
use bksave::config::AppConfig;
use bksave::context::AppContext;
use bksave::core::{
    BackupJob, BackupMode, BackupStatus, BusinessSoftwareGate, CopyTransfer, FileTransfer,
    Orchestrator, ProcessProbe, RunOutcome, TransferUnit, read_snapshot,
};
use bksave::{BackupError, ErrorKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    temp: TempDir,
    ctx: AppContext,
}

impl Fixture {
    /// One job per name, each with three source files.
    async fn new(names: &[&str]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: temp.path().join("data"),
            business_poll_ms: 20,
            ..AppConfig::default()
        };
        let ctx = AppContext::new(config);

        for name in names {
            let source = temp.path().join(name).join("src");
            fs::create_dir_all(source.join("sub")).unwrap();
            fs::write(source.join("a.txt"), b"alpha").unwrap();
            fs::write(source.join("b.txt"), b"bravo!").unwrap();
            fs::write(source.join("sub").join("c.txt"), b"charlie").unwrap();

            ctx.jobs
                .add(BackupJob::new(
                    *name,
                    source,
                    temp.path().join(name).join("dst"),
                    BackupMode::Full,
                ))
                .await
                .unwrap();
        }

        Self { temp, ctx }
    }

    fn target(&self, name: &str) -> PathBuf {
        self.temp.path().join(name).join("dst")
    }
}

/// Copies for real, but each file waits for a permit first.
struct GatedTransfer {
    inner: CopyTransfer,
    permits: Semaphore,
    started: mpsc::UnboundedSender<PathBuf>,
    calls: AtomicUsize,
}

impl GatedTransfer {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transfer = Self {
            inner: CopyTransfer::default(),
            permits: Semaphore::new(0),
            started: tx,
            calls: AtomicUsize::new(0),
        };
        (Arc::new(transfer), rx)
    }

    fn release_all(&self) {
        self.permits.add_permits(1000);
    }
}

#[async_trait]
impl TransferUnit for GatedTransfer {
    async fn transfer(&self, source: &Path, target: &Path) -> bksave::Result<FileTransfer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(source.to_path_buf());
        let _permit = self.permits.acquire().await.unwrap();
        self.inner.transfer(source, target).await
    }
}

#[derive(Default)]
struct FakeProbe {
    running: AtomicBool,
}

impl ProcessProbe for FakeProbe {
    fn is_running(&self, name: &str) -> bool {
        name == "calc" && self.running.load(Ordering::SeqCst)
    }
}

/// Never reports the process, but takes a while to answer.
struct SlowProbe {
    delay: Duration,
}

impl ProcessProbe for SlowProbe {
    fn is_running(&self, _name: &str) -> bool {
        std::thread::sleep(self.delay);
        false
    }
}

fn no_business_gate() -> BusinessSoftwareGate {
    BusinessSoftwareGate::with_probe(None, Arc::new(FakeProbe::default()))
}

/// Poll the in-memory progress until `check` holds.
async fn wait_for_state(
    ctx: &AppContext,
    name: &str,
    check: impl Fn(&bksave::core::BackupState) -> bool,
) {
    timeout(WAIT, async {
        loop {
            if let Some(state) = ctx.progress.get(name).await {
                if check(&state) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for progress");
}

#[tokio::test]
async fn test_full_then_differential_run() {
    let fixture = Fixture::new(&["docs"]).await;
    let orchestrator = Orchestrator::new(fixture.ctx.clone());

    let outcomes = timeout(WAIT, orchestrator.run("1")).await.unwrap().unwrap();
    assert_eq!(outcomes.len(), 1);
    let state = outcomes[0].state();
    assert_eq!(state.status, BackupStatus::Completed);
    assert_eq!(state.total_files, 3);
    assert_eq!(state.files_remaining, 0);
    assert_eq!(state.bytes_remaining, 0);
    assert_eq!(
        fs::read(fixture.target("docs").join("sub").join("c.txt")).unwrap(),
        b"charlie"
    );

    // Switch to differential and touch one file.
    let mut job = fixture.ctx.jobs.get("docs").await.unwrap();
    job.mode = BackupMode::Differential;
    fixture.ctx.jobs.update("docs", job.clone()).await.unwrap();
    fs::write(job.source.join("b.txt"), b"bravo, changed").unwrap();

    let (transfer, _started) = GatedTransfer::new();
    transfer.release_all();
    let orchestrator =
        Orchestrator::with_parts(fixture.ctx.clone(), transfer.clone(), no_business_gate());

    let outcomes = timeout(WAIT, orchestrator.run("1")).await.unwrap().unwrap();
    assert_eq!(outcomes[0].state().status, BackupStatus::Completed);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read(fixture.target("docs").join("b.txt")).unwrap(),
        b"bravo, changed"
    );
}

#[tokio::test]
async fn test_concurrent_jobs_keep_separate_progress_slots() {
    let fixture = Fixture::new(&["docs", "photos", "music"]).await;
    let orchestrator = Orchestrator::new(fixture.ctx.clone());

    let outcomes = timeout(WAIT, orchestrator.run("1;3")).await.unwrap().unwrap();
    let names: Vec<&str> = outcomes.iter().map(|o| o.state().name()).collect();
    assert_eq!(names, ["docs", "music"]);

    let snapshot = read_snapshot(&fixture.ctx.config.state_path()).await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.values().all(|s| s.status == BackupStatus::Completed));
    assert!(!fixture.target("photos").exists());
}

#[tokio::test]
async fn test_invalid_selection_starts_nothing() {
    let fixture = Fixture::new(&["docs", "photos"]).await;
    let orchestrator = Orchestrator::new(fixture.ctx.clone());

    for selection in ["6", "2-1", "", "1;x"] {
        let err = orchestrator.start(selection).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidSelection, "{:?}", selection);
    }

    assert!(orchestrator.running_jobs().is_empty());
    assert!(!fixture.target("docs").exists());
}

#[tokio::test]
async fn test_pause_holds_job_until_resume() {
    let fixture = Fixture::new(&["docs"]).await;
    let (transfer, mut started) = GatedTransfer::new();
    let orchestrator =
        Orchestrator::with_parts(fixture.ctx.clone(), transfer.clone(), no_business_gate());

    let mut handles = orchestrator.start("1").await.unwrap();
    let handle = handles.remove(0);

    timeout(WAIT, started.recv()).await.unwrap().unwrap();
    assert!(orchestrator.pause("docs"));
    transfer.release_all();

    // The in-flight file finishes, then the job parks before the next one.
    wait_for_state(&fixture.ctx, "docs", |s| s.files_remaining == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 1);
    assert!(handle.control().is_manually_paused());
    assert!(!handle.is_finished());

    assert!(orchestrator.resume("docs"));
    let outcome = timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(outcome.state().status, BackupStatus::Completed);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_stop_keeps_last_snapshot() {
    let fixture = Fixture::new(&["docs"]).await;
    let (transfer, mut started) = GatedTransfer::new();
    let orchestrator =
        Orchestrator::with_parts(fixture.ctx.clone(), transfer.clone(), no_business_gate());

    let handle = orchestrator.start("1").await.unwrap().remove(0);
    timeout(WAIT, started.recv()).await.unwrap().unwrap();

    assert!(orchestrator.stop("docs"));
    transfer.release_all();

    let outcome = timeout(WAIT, handle.wait()).await.unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.state().files_remaining, 2);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 1);

    let snapshot = read_snapshot(&fixture.ctx.config.state_path()).await.unwrap();
    let saved = &snapshot["docs"];
    assert_eq!(saved.status, BackupStatus::Active);
    assert_eq!(saved.files_remaining, 2);
    assert!(saved.cancelled);
    assert!(saved.is_terminal());

    // The job left the registry, so stopping again finds nothing.
    assert!(orchestrator.running_jobs().is_empty());
    assert!(!orchestrator.stop("docs"));
}

#[tokio::test]
async fn test_totals_fixed_when_source_grows() {
    let fixture = Fixture::new(&["docs"]).await;
    let (transfer, mut started) = GatedTransfer::new();
    let orchestrator =
        Orchestrator::with_parts(fixture.ctx.clone(), transfer.clone(), no_business_gate());

    let handle = orchestrator.start("1").await.unwrap().remove(0);
    timeout(WAIT, started.recv()).await.unwrap().unwrap();

    let at_start = fixture.ctx.progress.get("docs").await.unwrap();
    assert_eq!(at_start.total_files, 3);
    assert_eq!(at_start.total_bytes, 5 + 6 + 7);

    let source = fixture.temp.path().join("docs").join("src");
    fs::write(source.join("late.txt"), b"arrived mid-run").unwrap();
    fs::create_dir(source.join("new")).unwrap();
    fs::write(source.join("new").join("d.txt"), b"delta").unwrap();
    transfer.release_all();

    let state = timeout(WAIT, handle.wait()).await.unwrap().into_state();
    assert_eq!(state.status, BackupStatus::Completed);
    assert_eq!(state.total_files, at_start.total_files);
    assert_eq!(state.total_bytes, at_start.total_bytes);
    assert_eq!(state.files_remaining, 0);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 3);
    assert!(!fixture.target("docs").join("late.txt").exists());
    assert!(!fixture.target("docs").join("new").exists());
}

#[tokio::test]
async fn test_running_job_cannot_start_twice() {
    let fixture = Fixture::new(&["docs", "photos"]).await;
    let (transfer, mut started) = GatedTransfer::new();
    let orchestrator =
        Orchestrator::with_parts(fixture.ctx.clone(), transfer.clone(), no_business_gate());

    let first = orchestrator.start("1").await.unwrap();
    timeout(WAIT, started.recv()).await.unwrap().unwrap();

    let err = orchestrator.start("2;1").await.err().unwrap();
    assert!(matches!(err, BackupError::AlreadyRunning(ref name) if name == "docs"));
    assert_eq!(orchestrator.running_jobs(), ["docs"]);

    transfer.release_all();
    for handle in first {
        let outcome = timeout(WAIT, handle.wait()).await.unwrap();
        assert_eq!(outcome.state().status, BackupStatus::Completed);
    }

    // Once finished, the same job can run again.
    let outcomes = timeout(WAIT, orchestrator.run("1;2")).await.unwrap().unwrap();
    assert_eq!(outcomes.len(), 2);
}

#[tokio::test]
async fn test_business_software_holds_jobs() {
    let fixture = Fixture::new(&["docs", "photos"]).await;
    let probe = Arc::new(FakeProbe::default());
    probe.running.store(true, Ordering::SeqCst);

    let gate = BusinessSoftwareGate::with_probe(Some("calc".into()), probe.clone());
    let transfer: Arc<dyn TransferUnit> = Arc::new(CopyTransfer::default());
    let orchestrator = Orchestrator::with_parts(fixture.ctx.clone(), transfer, gate);

    let handles = orchestrator.start("1-2").await.unwrap();
    for handle in &handles {
        assert!(handle.control().is_business_paused());
        // A manual resume does not override the business hold.
        handle.resume();
        assert!(handle.control().is_paused());
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    for name in ["docs", "photos"] {
        let state = fixture.ctx.progress.get(name).await.unwrap();
        assert_eq!(state.files_remaining, state.total_files);
        assert_eq!(state.status, BackupStatus::Inactive);
    }

    probe.running.store(false, Ordering::SeqCst);

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(timeout(WAIT, handle.wait()).await.unwrap());
    }
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, RunOutcome::Finished(s) if s.status == BackupStatus::Completed))
    );
}

#[tokio::test]
async fn test_missing_source_fails_only_that_job() {
    let fixture = Fixture::new(&["docs", "photos"]).await;
    fs::remove_dir_all(fixture.temp.path().join("photos").join("src")).unwrap();

    let orchestrator = Orchestrator::new(fixture.ctx.clone());
    let outcomes = timeout(WAIT, orchestrator.run("1;2")).await.unwrap().unwrap();

    assert_eq!(outcomes[0].state().status, BackupStatus::Completed);
    match &outcomes[1] {
        RunOutcome::Failed { state, error } => {
            assert_eq!(state.status, BackupStatus::Error);
            assert_eq!(error.kind(), ErrorKind::DirectoryNotFound);
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_new_batch_drops_only_stale_slots() {
    let fixture = Fixture::new(&["docs", "photos"]).await;
    let orchestrator = Orchestrator::new(fixture.ctx.clone());
    timeout(WAIT, orchestrator.run("1")).await.unwrap().unwrap();

    let (transfer, mut started) = GatedTransfer::new();
    let orchestrator =
        Orchestrator::with_parts(fixture.ctx.clone(), transfer.clone(), no_business_gate());

    // Nothing is running, so the finished `docs` slot goes away.
    let photos = orchestrator.start("2").await.unwrap();
    timeout(WAIT, started.recv()).await.unwrap().unwrap();
    let names: Vec<String> = fixture.ctx.progress.get_all().await.into_keys().collect();
    assert_eq!(names, ["photos"]);

    // A batch started next to a running one clears nothing.
    let docs = orchestrator.start("1").await.unwrap();
    timeout(WAIT, started.recv()).await.unwrap().unwrap();
    assert_eq!(fixture.ctx.progress.len().await, 2);

    transfer.release_all();
    for handle in photos.into_iter().chain(docs) {
        timeout(WAIT, handle.wait()).await.unwrap();
    }

    let snapshot = read_snapshot(&fixture.ctx.config.state_path()).await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.values().all(|s| s.status == BackupStatus::Completed));
}

#[tokio::test]
async fn test_abandoned_start_releases_jobs() {
    let fixture = Fixture::new(&["docs"]).await;
    let probe = Arc::new(SlowProbe {
        delay: Duration::from_millis(300),
    });
    let gate = BusinessSoftwareGate::with_probe(Some("calc".into()), probe);
    let transfer: Arc<dyn TransferUnit> = Arc::new(CopyTransfer::default());
    let orchestrator = Orchestrator::with_parts(fixture.ctx.clone(), transfer, gate);

    // Give up while `start` waits on the business software check.
    let abandoned = timeout(Duration::from_millis(50), orchestrator.start("1")).await;
    assert!(abandoned.is_err());
    assert!(orchestrator.running_jobs().is_empty());

    let outcomes = timeout(WAIT, orchestrator.run("1")).await.unwrap().unwrap();
    assert_eq!(outcomes[0].state().status, BackupStatus::Completed);
}
