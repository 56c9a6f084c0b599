//! Workspace storage — one host directory per sandbox, mounted into its container

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;

/// The workspace storage collaborator
#[async_trait]
pub trait WorkspaceStorage: Send + Sync {
    /// Host path of a sandbox's workspace. Pure and injective over valid IDs.
    fn workspace_path(&self, sandbox_id: &str) -> PathBuf;
    async fn ensure_directory(&self, path: &Path) -> Result<()>;
    /// Remove a directory tree; a missing directory is not an error
    async fn remove_directory(&self, path: &Path) -> Result<()>;
}

/// Workspaces as subdirectories of a local root
pub struct LocalWorkspaceStorage {
    root: PathBuf,
}

impl LocalWorkspaceStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl WorkspaceStorage for LocalWorkspaceStorage {
    fn workspace_path(&self, sandbox_id: &str) -> PathBuf {
        self.root.join(sandbox_id)
    }

    async fn ensure_directory(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        debug!("Workspace directory ready: {}", path.display());
        Ok(())
    }

    async fn remove_directory(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!("Removed workspace {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
