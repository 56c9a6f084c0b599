//! Workspace file access — read, write and list inside a sandbox's workspace
//!
//! Paths are interpreted relative to the workspace root; a leading `/` is
//! dropped so `/index.html` and `index.html` name the same file.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{ResourceKind, Result, RunboxError};

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// Join `relative` onto `root`, rejecting anything that climbs out
pub fn resolve_in_workspace(root: &Path, relative: &str) -> Result<PathBuf> {
    let trimmed = relative.trim_start_matches('/');
    let mut resolved = root.to_path_buf();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RunboxError::InvalidInput(format!(
                    "path '{}' escapes the workspace",
                    relative
                )));
            }
        }
    }
    Ok(resolved)
}

/// Symlinks inside the workspace must not lead outside it
async fn ensure_contained(root: &Path, path: &Path) -> Result<()> {
    let canonical_root = tokio::fs::canonicalize(root).await?;
    let canonical = tokio::fs::canonicalize(path).await?;
    if !canonical.starts_with(&canonical_root) {
        return Err(RunboxError::InvalidInput(format!(
            "'{}' resolves outside the workspace",
            path.display()
        )));
    }
    Ok(())
}

fn map_missing(err: std::io::Error, relative: &str) -> RunboxError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RunboxError::not_found(ResourceKind::File, relative)
    } else {
        err.into()
    }
}

pub async fn read_file(root: &Path, relative: &str) -> Result<String> {
    let path = resolve_in_workspace(root, relative)?;
    ensure_contained(root, &path)
        .await
        .map_err(|e| match e {
            RunboxError::Io(io) => map_missing(io, relative),
            other => other,
        })?;
    debug!("Reading {}", path.display());
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| map_missing(e, relative))
}

/// Write `content`, creating parent directories as needed
pub async fn write_file(root: &Path, relative: &str, content: &str) -> Result<()> {
    let path = resolve_in_workspace(root, relative)?;
    if path == root {
        return Err(RunboxError::InvalidInput("file path is required".to_string()));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
        ensure_contained(root, parent).await?;
    }
    if tokio::fs::symlink_metadata(&path).await.is_ok() {
        ensure_contained(root, &path).await?;
    }
    debug!("Writing {} ({} bytes)", path.display(), content.len());
    tokio::fs::write(&path, content).await?;
    Ok(())
}

/// Entries of a directory, sorted by name
pub async fn list_directory(root: &Path, relative: &str) -> Result<Vec<DirEntry>> {
    let path = resolve_in_workspace(root, relative)?;
    ensure_contained(root, &path)
        .await
        .map_err(|e| match e {
            RunboxError::Io(io) => map_missing(io, relative),
            other => other,
        })?;

    let mut reader = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| map_missing(e, relative))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let file_type = entry.file_type().await?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind: if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Dir
            },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
