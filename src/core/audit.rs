//! Daily audit log of transferred files, in JSON or XML.

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::LogFormat;
use crate::db::write_atomic;
use crate::error::{BackupError, ErrorKind, Result};

const XML_ROOT_OPEN: &str = "<Logs>";
const XML_ROOT_CLOSE: &str = "</Logs>";

/// One transferred (or failed) file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Local>,
    pub job: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub size: u64,
    pub transfer_ms: i64,
    /// 0 when the file was not encrypted, negative when encryption failed.
    pub encryption_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn success(
        job: &str,
        source: &Path,
        target: &Path,
        size: u64,
        transfer: Duration,
        encryption: Option<Duration>,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            job: job.to_string(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            size,
            transfer_ms: millis(transfer),
            encryption_ms: encryption.map(millis).unwrap_or(0),
            error: None,
        }
    }

    pub fn failure(job: &str, source: &Path, target: &Path, size: u64, error: &BackupError) -> Self {
        Self {
            timestamp: Local::now(),
            job: job.to_string(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            size,
            transfer_ms: -1,
            encryption_ms: if error.kind() == ErrorKind::Encryption { -1 } else { 0 },
            error: Some(error.to_string()),
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Appends `AuditEntry` records to `<dir>/<YYYY-MM-DD>.<json|xml>`.
///
/// Appends from concurrent jobs are serialized through an internal lock.
pub struct AuditLog {
    dir: PathBuf,
    format: LogFormat,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, format: LogFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
            lock: Mutex::new(()),
        }
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}.{}", date.format("%Y-%m-%d"), self.format.extension()))
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.file_for(entry.timestamp.date_naive());

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let contents = match self.format {
            LogFormat::Json => append_json(&existing, entry)?,
            LogFormat::Xml => append_xml(&existing, entry),
        };

        write_atomic(&path, contents.as_bytes()).await?;
        Ok(())
    }
}

fn append_json(existing: &str, entry: &AuditEntry) -> Result<String> {
    let mut entries: Vec<AuditEntry> = if existing.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(existing)?
    };
    entries.push(entry.clone());
    Ok(serde_json::to_string_pretty(&entries)?)
}

fn append_xml(existing: &str, entry: &AuditEntry) -> String {
    let body = existing
        .trim_end()
        .strip_suffix(XML_ROOT_CLOSE)
        .map(str::to_string)
        .unwrap_or_else(|| format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{}\n", XML_ROOT_OPEN));

    let mut out = body;
    out.push_str("  <Entry>\n");
    push_element(&mut out, "Timestamp", &entry.timestamp.to_rfc3339());
    push_element(&mut out, "Job", &entry.job);
    push_element(&mut out, "Source", &entry.source.display().to_string());
    push_element(&mut out, "Target", &entry.target.display().to_string());
    push_element(&mut out, "Size", &entry.size.to_string());
    push_element(&mut out, "TransferMs", &entry.transfer_ms.to_string());
    push_element(&mut out, "EncryptionMs", &entry.encryption_ms.to_string());
    if let Some(error) = &entry.error {
        push_element(&mut out, "Error", error);
    }
    out.push_str("  </Entry>\n");
    out.push_str(XML_ROOT_CLOSE);
    out.push('\n');
    out
}

fn push_element(out: &mut String, name: &str, value: &str) {
    out.push_str("    <");
    out.push_str(name);
    out.push('>');
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out.push_str("</");
    out.push_str(name);
    out.push_str(">\n");
}
