//! Encryption delegate: `bksave-crypt <source> <destination> <key>`.
//!
//! XORs `source` against a keystream derived from `key` and writes the
//! result to `destination`. Source and destination may be the same file.
//! Exit status: 0 on success, 1 on bad usage, 2 on I/O failure. No partial
//! destination is left behind on failure.

use anyhow::{Context, Result};
use bksave::core::cipher;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [source, destination, key] = args.as_slice() else {
        eprintln!("usage: bksave-crypt <source> <destination> <key>");
        return ExitCode::from(1);
    };

    if key.is_empty() {
        eprintln!("bksave-crypt: key must not be empty");
        return ExitCode::from(1);
    }

    match encrypt(Path::new(source), Path::new(destination), key.as_bytes()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bksave-crypt: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn encrypt(source: &Path, destination: &Path, key: &[u8]) -> Result<u64> {
    // Always write to a sibling first so a failure never leaves a half-written
    // destination, and so in-place encryption does not read what it writes.
    let staging = staging_path(destination);

    let result = (|| -> Result<u64> {
        let input = File::open(source)
            .with_context(|| format!("cannot open {}", source.display()))?;
        let output = File::create(&staging)
            .with_context(|| format!("cannot create {}", staging.display()))?;

        let mut reader = BufReader::new(input);
        let mut writer = BufWriter::new(output);
        let bytes = cipher::transform(&mut reader, &mut writer, key)
            .with_context(|| format!("cannot encrypt {}", source.display()))?;

        let output = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context("cannot flush output")?;
        output.sync_all().context("cannot sync output")?;

        fs::rename(&staging, destination)
            .with_context(|| format!("cannot replace {}", destination.display()))?;
        Ok(bytes)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".crypt-{}", std::process::id()));
    destination.with_file_name(name)
}
