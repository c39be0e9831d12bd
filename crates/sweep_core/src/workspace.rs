use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SweepError;

/// Directory inside every workspace reserved for launcher bookkeeping.
pub const METADATA_DIR: &str = "_sweep";
pub const OUTCOMES_FILE: &str = "outcomes.jsonl";
pub const LOGS_DIR: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKey {
    Sweep,
    Ordinal,
}

impl PartitionKey {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sweep => "sweep_id",
            Self::Ordinal => "ordinal",
        }
    }
}

pub fn sweep_prefix(root: &Path, sweep_id: &str) -> PathBuf {
    root.join(format!("{}={sweep_id}", PartitionKey::Sweep.as_str()))
}

/// Pure derivation of the workspace owned by `ordinal`.
///
/// Distinct ordinals never share a path and the same ordinal always maps to
/// the same path, so a retried worker lands back in its own directory.
pub fn workspace_path(root: &Path, sweep_id: &str, ordinal: usize) -> PathBuf {
    sweep_prefix(root, sweep_id).join(format!("{}={ordinal:05}", PartitionKey::Ordinal.as_str()))
}

pub fn metadata_dir(workspace: &Path) -> PathBuf {
    workspace.join(METADATA_DIR)
}

pub fn outcomes_path(workspace: &Path) -> PathBuf {
    metadata_dir(workspace).join(OUTCOMES_FILE)
}

pub fn rank_log_path(workspace: &Path, rank: usize, stream: &str) -> PathBuf {
    metadata_dir(workspace)
        .join(LOGS_DIR)
        .join(format!("rank-{rank}.{stream}.log"))
}

/// Creates the workspace for `ordinal` if it is missing and returns it.
///
/// Idempotent: an existing directory (for example one left behind by a
/// crashed attempt) is reused as-is and nothing inside it is removed.
pub fn allocate(root: &Path, sweep_id: &str, ordinal: usize) -> Result<PathBuf, SweepError> {
    let path = workspace_path(root, sweep_id, ordinal);
    ensure_workspace(&path)?;
    Ok(path)
}

pub fn ensure_workspace(path: &Path) -> Result<(), SweepError> {
    let workspace_error = |source| SweepError::Workspace {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(path).map_err(workspace_error)?;
    fs::create_dir_all(metadata_dir(path).join(LOGS_DIR)).map_err(workspace_error)?;
    Ok(())
}
