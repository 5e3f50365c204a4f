//! Persistent error log.
//!
//! Every error that reaches the pipeline executor is printed to the
//! console and appended here with a timestamp for postmortem inspection.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const ERROR_LOG_FILENAME: &str = "build-errors.log";

#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(workdir: &Path) -> Self {
        Self {
            path: workdir.join(ERROR_LOG_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timestamped entry. `scope` names the failing step.
    pub fn append(&self, scope: &str, message: &str) -> Result<()> {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown-time".to_string());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening error log '{}'", self.path.display()))?;

        writeln!(file, "[{}] {}: {}", timestamp, scope, message)
            .with_context(|| format!("writing error log '{}'", self.path.display()))?;
        Ok(())
    }

    /// Best-effort variant for failure paths where a logging error must
    /// not mask the original error.
    pub fn append_best_effort(&self, scope: &str, message: &str) {
        if let Err(e) = self.append(scope, message) {
            eprintln!("  [WARN] could not write error log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_creates_and_extends_log() {
        let tmp = TempDir::new().unwrap();
        let log = ErrorLog::new(tmp.path());

        log.append("fetch", "download failed").unwrap();
        log.append("build", "make failed").unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("fetch: download failed"));
        assert!(lines[1].contains("build: make failed"));
    }
}
