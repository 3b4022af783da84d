use crate::config::AppConfig;
use crate::core::{AuditLog, ProgressRecorder};
use crate::db::JobStore;
use std::sync::Arc;

/// Services shared across the application, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub jobs: JobStore,
    pub progress: ProgressRecorder,
    pub audit: Option<Arc<AuditLog>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            jobs: JobStore::new(config.jobs_path(), config.max_jobs),
            progress: ProgressRecorder::new(config.state_path()),
            audit: Some(Arc::new(AuditLog::new(config.log_path(), config.log_format))),
            config: Arc::new(config),
        }
    }
}
