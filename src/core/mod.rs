pub mod audit;
pub mod business;
pub mod cipher;
pub mod control;
pub mod encryption;
pub mod engine;
pub mod enumerator;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod selection;
pub mod transfer;

pub use audit::{AuditEntry, AuditLog};
pub use business::{BusinessSoftwareGate, ProcFsProbe, ProcessProbe};
pub use control::{Checkpoint, JobControl, JobRegistry};
pub use encryption::EncryptionDelegate;
pub use engine::{JobRunner, RunOutcome};
pub use enumerator::FileTree;
pub use models::{BackupJob, BackupMode, BackupState, BackupStatus};
pub use orchestrator::{BatchSummary, JobHandle, Orchestrator};
pub use progress::{ProgressRecorder, read_snapshot};
pub use selection::parse_selection;
pub use transfer::{CopyTransfer, FileTransfer, TransferUnit};
