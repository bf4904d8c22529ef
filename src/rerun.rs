//! Rerun state: the target partition of the last invocation
//!
//! Stored as a JSON array of `{"target", "status"}` records so a later
//! invocation can ask for `--rerun failure` and get exactly the targets that
//! failed last time, in their original order.

use crate::error::{Result, TetherError};
use crate::result::ResultSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Which slice of the previous invocation to select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RerunMode {
    Success,
    Failure,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerunStatus {
    Success,
    Failure,
}

/// One target's outcome in the last invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerunRecord {
    pub target: String,
    pub status: RerunStatus,
}

impl RerunRecord {
    pub fn from_result_set(results: &ResultSet) -> Vec<RerunRecord> {
        results
            .iter()
            .map(|r| RerunRecord {
                target: r.target.name.clone(),
                status: if r.ok() {
                    RerunStatus::Success
                } else {
                    RerunStatus::Failure
                },
            })
            .collect()
    }
}

/// File-backed rerun state
#[derive(Debug, Clone)]
pub struct RerunStore {
    path: PathBuf,
}

impl RerunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored state with this ResultSet's partition
    pub fn write(&self, results: &ResultSet) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let records = RerunRecord::from_result_set(results);
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.path, json)?;
        info!(
            "Saved rerun state for {} targets to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Target names from the last invocation matching `mode`
    ///
    /// A missing or unreadable file is an error, never an empty selection.
    pub fn read(&self, mode: RerunMode) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            TetherError::Rerun(format!(
                "Could not read rerun file {}: {}. Run a command first or disable --rerun",
                self.path.display(),
                e
            ))
        })?;
        let records: Vec<RerunRecord> = serde_json::from_str(&content).map_err(|e| {
            TetherError::Rerun(format!(
                "Rerun file {} is malformed: {}",
                self.path.display(),
                e
            ))
        })?;

        let selected: Vec<String> = records
            .into_iter()
            .filter(|record| match mode {
                RerunMode::All => true,
                RerunMode::Success => record.status == RerunStatus::Success,
                RerunMode::Failure => record.status == RerunStatus::Failure,
            })
            .map(|record| record.target)
            .collect();
        debug!("Rerun {:?} selected {} targets", mode, selected.len());
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, CommandOutput};
    use crate::result::{Payload, TargetResult};
    use crate::target::{Target, TransportKind};
    use tempfile::TempDir;

    fn result(name: &str, exit_code: i32) -> TargetResult {
        TargetResult::from_payload(
            Target::parse(name, TransportKind::Ssh).unwrap(),
            ActionKind::Command,
            Payload::Command(CommandOutput {
                exit_code,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_rerun_selects_partition() {
        let dir = TempDir::new().unwrap();
        let store = RerunStore::new(dir.path().join(".tether").join("rerun.json"));
        let set = ResultSet::new(vec![result("a", 0), result("b", 1), result("c", 0)]).unwrap();
        store.write(&set).unwrap();

        assert_eq!(store.read(RerunMode::Failure).unwrap(), vec!["b"]);
        assert_eq!(store.read(RerunMode::Success).unwrap(), vec!["a", "c"]);
        assert_eq!(store.read(RerunMode::All).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let store = RerunStore::new(dir.path().join("missing.json"));
        assert!(matches!(
            store.read(RerunMode::All),
            Err(TetherError::Rerun(_))
        ));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rerun.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            RerunStore::new(path).read(RerunMode::Failure),
            Err(TetherError::Rerun(_))
        ));
    }
}
