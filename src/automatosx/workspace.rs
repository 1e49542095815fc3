//! Per-agent filesystem workspaces.
//!
//! Every agent gets a private directory under
//! `.automatosx/workspaces/<agent>/`; the PRD and tmp directories are
//! shared across agents for handoff artifacts. Workspaces are advisory:
//! the core creates directories and resolves paths but takes no
//! cross-agent file locks, so callers must not write the same shared path
//! from two agents at once.

use crate::automatosx::config::{Environment, WorkspaceSection};
use crate::automatosx::paths::path_to_storage;
use crate::automatosx::profile::is_valid_agent_name;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Errors raised by the workspace manager.
#[derive(Debug)]
pub enum WorkspaceError {
    /// The agent name fails the profile name rule.
    InvalidAgentName(String),
    /// Filesystem failure.
    Io(String),
}

impl WorkspaceError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            WorkspaceError::InvalidAgentName(_) => "InvalidAgentName",
            WorkspaceError::Io(_) => "WorkspaceIoError",
        }
    }
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::InvalidAgentName(name) => {
                write!(f, "Invalid agent name '{}'", name)
            }
            WorkspaceError::Io(message) => write!(f, "Workspace I/O error: {}", message),
        }
    }
}

impl Error for WorkspaceError {}

/// Resolver for per-agent and shared workspace directories.
pub struct WorkspaceManager {
    env: Environment,
    prd_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager from the environment and the `workspace` config
    /// section.
    pub fn new(env: Environment, section: &WorkspaceSection) -> Self {
        let prd_dir = env.project_dir.join(&section.prd_path);
        let tmp_dir = env.project_dir.join(&section.tmp_path);
        Self {
            env,
            prd_dir,
            tmp_dir,
        }
    }

    /// Resolve (and create) the private workspace for an agent.
    pub fn get_workspace(&self, agent: &str) -> Result<PathBuf, WorkspaceError> {
        if !is_valid_agent_name(agent) {
            return Err(WorkspaceError::InvalidAgentName(agent.to_string()));
        }
        let dir = self.env.workspaces_dir().join(agent);
        std::fs::create_dir_all(&dir).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        Ok(dir)
    }

    /// The shared PRD directory, created on demand.
    pub fn prd_dir(&self) -> Result<PathBuf, WorkspaceError> {
        std::fs::create_dir_all(&self.prd_dir).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        Ok(self.prd_dir.clone())
    }

    /// The shared tmp directory, created on demand.
    pub fn tmp_dir(&self) -> Result<PathBuf, WorkspaceError> {
        std::fs::create_dir_all(&self.tmp_dir).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        Ok(self.tmp_dir.clone())
    }

    /// Delete tmp files older than the given number of days.
    ///
    /// Returns how many files were removed. Unreadable entries are
    /// skipped with a warning rather than failing the sweep.
    pub fn cleanup_tmp(&self, max_age_days: u32) -> Result<usize, WorkspaceError> {
        if !self.tmp_dir.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(u64::from(max_age_days) * 86_400));
        let Some(cutoff) = cutoff else { return Ok(0) };

        let mut removed = 0;
        let entries =
            std::fs::read_dir(&self.tmp_dir).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            match modified {
                Ok(modified) if modified < cutoff => match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => log::warn!("Cannot remove {}: {}", path.display(), err),
                },
                Ok(_) => {}
                Err(err) => log::warn!("Cannot stat {}: {}", path.display(), err),
            }
        }
        if removed > 0 {
            log::info!("Removed {} stale tmp files", removed);
        }
        Ok(removed)
    }

    /// Files under a workspace modified at or after `since`, as
    /// storage-form paths relative to the workspace root.
    ///
    /// Used to report the artifacts a delegated agent produced.
    pub fn files_modified_since(
        &self,
        workspace: &Path,
        since: SystemTime,
    ) -> Vec<String> {
        let mut files = Vec::new();
        collect_modified(workspace, workspace, since, &mut files);
        files.sort();
        files
    }
}

fn collect_modified(root: &Path, dir: &Path, since: SystemTime, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_modified(root, &path, since, out);
        } else if let Ok(metadata) = entry.metadata() {
            if metadata.modified().map(|m| m >= since).unwrap_or(false) {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(path_to_storage(rel));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path());
        let manager = WorkspaceManager::new(env, &WorkspaceSection::default());
        (dir, manager)
    }

    #[test]
    fn creates_per_agent_directories() {
        let (_dir, manager) = manager();
        let a = manager.get_workspace("backend").unwrap();
        let b = manager.get_workspace("frontend").unwrap();
        assert!(a.exists());
        assert!(b.exists());
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_invalid_agent_names() {
        let (_dir, manager) = manager();
        assert!(matches!(
            manager.get_workspace("../escape"),
            Err(WorkspaceError::InvalidAgentName(_))
        ));
    }

    #[test]
    fn reports_files_modified_since() {
        let (_dir, manager) = manager();
        let workspace = manager.get_workspace("backend").unwrap();
        let before = SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(5))
            .unwrap();
        std::fs::create_dir_all(workspace.join("out")).unwrap();
        std::fs::write(workspace.join("out/result.md"), "done").unwrap();

        let files = manager.files_modified_since(&workspace, before);
        assert_eq!(files, vec!["out/result.md".to_string()]);
    }

    #[test]
    fn tmp_cleanup_is_safe_on_missing_dir() {
        let (_dir, manager) = manager();
        assert_eq!(manager.cleanup_tmp(7).unwrap(), 0);
    }
}
