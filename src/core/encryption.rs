//! Out-of-process encryption.
//!
//! The cipher runs in its own executable (`bksave-crypt`) invoked with three
//! positional arguments: source path, destination path, key. Exit status 0
//! means success; anything else is a failure.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct EncryptionDelegate {
    executable: PathBuf,
    key: String,
    extensions: HashSet<String>,
}

impl EncryptionDelegate {
    pub fn new<I, S>(executable: impl Into<PathBuf>, key: impl Into<String>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            executable: executable.into(),
            key: key.into(),
            extensions: extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Build a delegate from user configuration.
    ///
    /// Returns `None` when no extension is configured, or when the key or the
    /// executable is missing; in the latter case files are copied in clear.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        if config.encrypted_extensions.is_empty() {
            return None;
        }

        let Some(key) = config.encryption_key.as_ref().filter(|k| !k.is_empty()) else {
            warn!("Encrypted extensions configured without a key, encryption disabled");
            return None;
        };

        let Some(executable) = config.resolve_crypt_executable() else {
            warn!("Encryption executable not found, encryption disabled");
            return None;
        };

        Some(Self::new(executable, key.clone(), &config.encrypted_extensions))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Whether `path` has one of the configured extensions (case-insensitive).
    pub fn applies_to(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Run the encryption executable and wait for it.
    ///
    /// On failure any output at `destination` is removed before returning.
    pub async fn encrypt(&self, source: &Path, destination: &Path) -> Result<Duration> {
        let started = Instant::now();

        debug!(
            source = %source.display(),
            destination = %destination.display(),
            "Invoking encryption delegate"
        );

        let outcome = Command::new(&self.executable)
            .arg(source)
            .arg(destination)
            .arg(&self.key)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        let message = match outcome {
            Ok(output) if output.status.success() => return Ok(started.elapsed()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                format!("encryption exited with {}: {}", output.status, stderr.trim())
            }
            Err(e) => format!(
                "failed to spawn {}: {}",
                self.executable.display(),
                e
            ),
        };

        if let Err(e) = tokio::fs::remove_file(destination).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %destination.display(), error = %e, "Failed to remove partial output");
            }
        }

        Err(BackupError::Encryption {
            path: source.to_path_buf(),
            message,
        })
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}
