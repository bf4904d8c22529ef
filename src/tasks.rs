//! Task discovery inside a project directory
//!
//! `name` lives at `tasks/<name>.*`, `mod::task` at
//! `modules/mod/tasks/task.*`, and a bare module name also tries
//! `modules/mod/tasks/init.*`. An optional `<task>.json` beside the
//! executable supplies metadata.

use crate::error::{Result, TetherError};
use crate::models::{TaskMetadata, TaskSpec};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Whether `name` is a valid task or plan name: `segment(::segment)*` where
/// each segment is `[a-z][a-z0-9_]*`
pub fn is_valid_content_name(name: &str) -> bool {
    name.split("::").all(|segment| {
        let mut chars = segment.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    })
}

#[derive(Debug, Clone)]
pub struct TaskLoader {
    project_root: PathBuf,
}

impl TaskLoader {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Directories and file stems to probe, in priority order
    fn candidates(&self, name: &str) -> Vec<(PathBuf, String)> {
        let segments: Vec<&str> = name.split("::").collect();
        match segments.as_slice() {
            [single] => vec![
                (self.project_root.join("tasks"), single.to_string()),
                (
                    self.project_root.join("modules").join(single).join("tasks"),
                    "init".to_string(),
                ),
            ],
            [module, rest @ ..] => {
                let mut dir = self.project_root.join("modules").join(module).join("tasks");
                let (stem, parents) = match rest.split_last() {
                    Some(split) => split,
                    None => return Vec::new(),
                };
                for parent in parents {
                    dir = dir.join(parent);
                }
                vec![(dir, stem.to_string())]
            }
            [] => Vec::new(),
        }
    }

    /// Locate a task and read its metadata
    pub fn load(&self, name: &str) -> Result<TaskSpec> {
        if !is_valid_content_name(name) {
            return Err(TetherError::Validation(format!(
                "Invalid task name '{}'",
                name
            )));
        }

        for (dir, stem) in self.candidates(name) {
            if let Some(executable) = find_executable(&dir, &stem)? {
                let metadata = read_metadata(&dir.join(format!("{}.json", stem)))?;
                debug!("Loaded task {} from {}", name, executable.display());
                return Ok(TaskSpec {
                    name: name.to_string(),
                    executable,
                    metadata,
                });
            }
        }
        Err(TetherError::TaskNotFound(name.to_string()))
    }
}

/// First non-metadata file named `<stem>` or `<stem>.<ext>` in `dir`
fn find_executable(dir: &Path, stem: &str) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let is_metadata = path.extension().and_then(|e| e.to_str()) == Some("json");
        if file_stem == stem && !is_metadata {
            matches.push(path);
        }
    }
    // read_dir order is platform dependent
    matches.sort();
    Ok(matches.into_iter().next())
}

fn read_metadata(path: &Path) -> Result<TaskMetadata> {
    if !path.exists() {
        return Ok(TaskMetadata::default());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        TetherError::Validation(format!(
            "Task metadata {} is malformed: {}",
            path.display(),
            e
        ))
    })
}
