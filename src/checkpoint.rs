//! Pipeline steps and the persisted checkpoint record.
//!
//! The pipeline is a fixed total order of six steps. After each step
//! commits, the checkpoint file is overwritten with that step's name so a
//! failed run can resume where it left off. The record is a small JSON
//! structure rather than bare text so corruption is detectable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const CHECKPOINT_FILENAME: &str = ".checkpoint.json";

/// One stage of the fixed build pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Prepare,
    Fetch,
    Install,
    Configure,
    Build,
    Cleanup,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::Prepare,
        Step::Fetch,
        Step::Install,
        Step::Configure,
        Step::Build,
        Step::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Prepare => "prepare",
            Step::Fetch => "fetch",
            Step::Install => "install",
            Step::Configure => "configure",
            Step::Build => "build",
            Step::Cleanup => "cleanup",
        }
    }

    /// The step after this one in the fixed order.
    pub fn successor(&self) -> Option<Step> {
        let idx = Step::ALL.iter().position(|s| s == self)?;
        Step::ALL.get(idx + 1).copied()
    }

    /// The step before this one in the fixed order.
    pub fn predecessor(&self) -> Option<Step> {
        let idx = Step::ALL.iter().position(|s| s == self)?;
        idx.checked_sub(1).and_then(|i| Step::ALL.get(i)).copied()
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted marker of the last successfully completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_completed_step: Step,
    pub timestamp: String,
}

/// Store for the single-checkpoint-per-workdir record.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(workdir: &Path) -> Self {
        Self {
            path: workdir.join(CHECKPOINT_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint. `None` means a fresh pipeline. A present but
    /// unparsable file is a hard error, not a silent fresh start.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("reading checkpoint '{}'", self.path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "checkpoint '{}' is corrupt; remove it to start fresh",
                self.path.display()
            )
        })?;
        Ok(Some(checkpoint))
    }

    /// Record `step` as the last completed step.
    pub fn record(&self, step: Step) -> Result<()> {
        let checkpoint = Checkpoint {
            last_completed_step: step,
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "unknown-time".to_string()),
        };
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a half-written record.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .with_context(|| format!("writing checkpoint '{}'", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("committing checkpoint '{}'", self.path.display()))?;
        Ok(())
    }

    /// Remove the checkpoint, returning the pipeline to the fresh state.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("removing checkpoint '{}'", self.path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn successor_walks_fixed_order() {
        assert_eq!(Step::Prepare.successor(), Some(Step::Fetch));
        assert_eq!(Step::Build.successor(), Some(Step::Cleanup));
        assert_eq!(Step::Cleanup.successor(), None);
        assert_eq!(Step::Prepare.predecessor(), None);
        assert_eq!(Step::Fetch.predecessor(), Some(Step::Prepare));
    }

    #[test]
    fn record_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());

        assert!(store.load().unwrap().is_none());
        store.record(Step::Fetch).unwrap();

        let cp = store.load().unwrap().unwrap();
        assert_eq!(cp.last_completed_step, Step::Fetch);
        assert!(!cp.timestamp.is_empty());
    }

    #[test]
    fn clear_returns_to_fresh_state() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        store.record(Step::Build).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_checkpoint_is_detected() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        std::fs::write(store.path(), b"prepare").unwrap();
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }
}
