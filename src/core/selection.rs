//! Job selection expressions such as `1;3-5`.
//!
//! Tokens are separated by `;`. Each token is a 1-based index or an inclusive
//! ascending range `a-b`. The result keeps first-appearance order with
//! duplicates removed.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{BackupError, Result};

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*(?:-\s*(\d+)\s*)?$").expect("valid token regex"));

/// Resolve `expr` against a list of `job_count` jobs into 0-based indices.
///
/// Any malformed or out-of-range token rejects the whole expression.
pub fn parse_selection(expr: &str, job_count: usize) -> Result<Vec<usize>> {
    if expr.trim().is_empty() {
        return Err(BackupError::selection(expr, "selection is empty"));
    }

    let mut selected = Vec::new();

    for token in expr.split(';') {
        let caps = TOKEN
            .captures(token)
            .ok_or_else(|| BackupError::selection(token.trim(), "expected `N` or `N-M`"))?;

        let start = parse_index(token, &caps[1], job_count)?;
        let end = match caps.get(2) {
            Some(m) => parse_index(token, m.as_str(), job_count)?,
            None => start,
        };

        if end < start {
            return Err(BackupError::selection(token.trim(), "range is descending"));
        }

        for index in start..=end {
            if !selected.contains(&(index - 1)) {
                selected.push(index - 1);
            }
        }
    }

    Ok(selected)
}

fn parse_index(token: &str, digits: &str, job_count: usize) -> Result<usize> {
    let index: usize = digits
        .parse()
        .map_err(|_| BackupError::selection(token.trim(), "index is too large"))?;

    if index == 0 || index > job_count {
        return Err(BackupError::selection(
            token.trim(),
            format!("index {} is outside 1..={}", index, job_count),
        ));
    }
    Ok(index)
}
