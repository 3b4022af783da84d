//! Single-file transfer: buffered copy plus optional encryption pass.

use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::core::encryption::EncryptionDelegate;
use crate::error::{BackupError, Result, join_error};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// What a successful transfer did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTransfer {
    pub bytes: u64,
    pub copy_time: Duration,
    /// `None` when the file was not encrypted.
    pub encryption_time: Option<Duration>,
}

/// Moves one file from source to target.
///
/// Implementations must not leave the caller without an answer: every
/// failure comes back as an `Err`, never a panic, so the engine can record
/// it and carry on with the next file.
#[async_trait]
pub trait TransferUnit: Send + Sync {
    async fn transfer(&self, source: &Path, target: &Path) -> Result<FileTransfer>;
}

/// Native copy, overwriting the target, followed by encryption when the
/// file's extension asks for it.
#[derive(Debug, Clone, Default)]
pub struct CopyTransfer {
    encryption: Option<EncryptionDelegate>,
}

impl CopyTransfer {
    pub fn new(encryption: Option<EncryptionDelegate>) -> Self {
        Self { encryption }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(EncryptionDelegate::from_config(config))
    }
}

#[async_trait]
impl TransferUnit for CopyTransfer {
    async fn transfer(&self, source: &Path, target: &Path) -> Result<FileTransfer> {
        let started = Instant::now();

        let bytes = {
            let source = source.to_path_buf();
            let target = target.to_path_buf();
            tokio::task::spawn_blocking(move || copy_file(&source, &target))
                .await
                .map_err(join_error)??
        };
        let copy_time = started.elapsed();

        let encryption_time = match &self.encryption {
            Some(delegate) if delegate.applies_to(source) => {
                let elapsed = delegate.encrypt(target, target).await?;
                // The delegate replaces the file, so restore the source timestamps.
                let (source, target) = (source.to_path_buf(), target.to_path_buf());
                tokio::task::spawn_blocking(move || preserve_timestamps(&source, &target))
                    .await
                    .map_err(join_error)??;
                Some(elapsed)
            }
            _ => None,
        };

        Ok(FileTransfer {
            bytes,
            copy_time,
            encryption_time,
        })
    }
}

/// Copy a single file and its timestamps.
///
/// Permissions are left at the process default so the next run can always
/// overwrite the target. Timestamps are kept because the differential filter
/// compares them.
pub(crate) fn copy_file(source: &Path, target: &Path) -> Result<u64> {
    let reader = File::open(source).map_err(|e| BackupError::transfer(source, e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);

    let writer = File::create(target).map_err(|e| {
        BackupError::transfer(source, format!("cannot create {}: {}", target.display(), e))
    })?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, writer);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| BackupError::transfer(source, e))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| BackupError::transfer(source, e))?;
        bytes_written += bytes_read as u64;
    }

    writer.flush().map_err(|e| BackupError::transfer(source, e))?;
    drop(writer);

    preserve_timestamps(source, target)?;
    Ok(bytes_written)
}

/// Copy access and modification times from `source` onto `target`.
fn preserve_timestamps(source: &Path, target: &Path) -> Result<()> {
    let metadata = fs::metadata(source).map_err(|e| BackupError::transfer(source, e))?;
    let atime = filetime::FileTime::from_last_access_time(&metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    filetime::set_file_times(target, atime, mtime)
        .map_err(|e| BackupError::transfer(source, format!("cannot set timestamps: {}", e)))
}
