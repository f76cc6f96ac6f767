//! Ephemeral working directories.
//!
//! A [`WorkspaceGuard`] owns a [`Workspace`] for the scope that created it and
//! removes it exactly once: explicitly through [`WorkspaceGuard::finish`], or
//! on drop if the scope exits early. Ownership can be handed off with
//! [`WorkspaceGuard::release`] or suppressed with [`WorkspaceGuard::keep`].

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub root: PathBuf,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(root: PathBuf, purpose: impl Into<String>) -> Self {
        Self {
            root,
            purpose: purpose.into(),
            created_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// Allocates and removes workspaces.
pub trait WorkspaceAllocator {
    /// Create a fresh directory that did not exist before and belongs to the caller.
    fn create(&self, purpose: &str) -> Result<Workspace>;

    /// Recursively delete the workspace.
    fn remove(&self, workspace: &Workspace) -> Result<()>;
}

/// Workspaces under a base directory (the system temp dir by default).
#[derive(Debug, Clone)]
pub struct TempWorkspaces {
    base: PathBuf,
}

impl TempWorkspaces {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn contains(&self, path: &Path) -> bool {
        let base = fs::canonicalize(&self.base).unwrap_or_else(|_| self.base.clone());
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        path != base && path.starts_with(&base)
    }
}

impl Default for TempWorkspaces {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl WorkspaceAllocator for TempWorkspaces {
    fn create(&self, purpose: &str) -> Result<Workspace> {
        fs::create_dir_all(&self.base)
            .map_err(|e| Error::workspace_allocation(purpose, e.to_string()))?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("divoc-{}-", purpose))
            .tempdir_in(&self.base)
            .map_err(|e| Error::workspace_allocation(purpose, e.to_string()))?;

        // Lifetime is managed by WorkspaceGuard from here on.
        let root = dir.keep();
        info!(purpose, path = %root.display(), "Created workspace");
        Ok(Workspace::new(root, purpose))
    }

    fn remove(&self, workspace: &Workspace) -> Result<()> {
        if !self.contains(&workspace.root) {
            return Err(Error::workspace_cleanup(
                &workspace.purpose,
                workspace.root.display().to_string(),
                format!("refusing to delete outside {}", self.base.display()),
            ));
        }

        info!(
            purpose = %workspace.purpose,
            path = %workspace.root.display(),
            "Cleaning temporary directory"
        );
        match fs::remove_dir_all(&workspace.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::workspace_cleanup(
                &workspace.purpose,
                workspace.root.display().to_string(),
                e.to_string(),
            )),
        }
    }
}

/// Scoped ownership of a workspace with guaranteed release.
pub struct WorkspaceGuard<'a> {
    allocator: &'a dyn WorkspaceAllocator,
    workspace: Option<Workspace>,
}

impl<'a> WorkspaceGuard<'a> {
    pub fn create(allocator: &'a dyn WorkspaceAllocator, purpose: &str) -> Result<Self> {
        let workspace = allocator.create(purpose)?;
        Ok(Self::adopt(allocator, workspace))
    }

    /// Take ownership of a workspace created elsewhere.
    pub fn adopt(allocator: &'a dyn WorkspaceAllocator, workspace: Workspace) -> Self {
        Self {
            allocator,
            workspace: Some(workspace),
        }
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    pub fn root(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|ws| ws.root.as_path())
    }

    /// Hand the workspace to a new owner without removing it.
    pub fn release(mut self) -> Option<Workspace> {
        self.workspace.take()
    }

    /// Leave the workspace on disk and return where it is.
    pub fn keep(mut self) -> Option<Workspace> {
        let workspace = self.workspace.take();
        if let Some(ws) = &workspace {
            info!(
                purpose = %ws.purpose,
                path = %ws.root.display(),
                "Keeping workspace"
            );
        }
        workspace
    }

    /// Remove the workspace now and report the outcome.
    pub fn finish(mut self) -> Result<()> {
        match self.workspace.take() {
            Some(ws) => self.allocator.remove(&ws),
            None => Ok(()),
        }
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        if let Some(ws) = self.workspace.take() {
            if let Err(err) = self.allocator.remove(&ws) {
                warn!(error = %err, "Workspace cleanup failed");
            }
        }
    }
}
