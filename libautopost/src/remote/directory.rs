//! Remote provider backed by a directory
//!
//! Useful with a network mount or a synced folder (rclone, Syncthing). Every
//! non-hidden subdirectory of the root is a remote folder; its name is also
//! its identifier.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{RemoteContentProvider, RemoteFolder};
use crate::error::RemoteSyncError;

pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn list(root: &Path) -> Result<Vec<RemoteFolder>, RemoteSyncError> {
    let entries = std::fs::read_dir(root)
        .map_err(|e| RemoteSyncError::Listing(format!("{}: {}", root.display(), e)))?;

    let mut folders = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RemoteSyncError::Listing(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(folder = %name, error = %e, "Cannot stat remote folder");
                continue;
            }
        };
        if !metadata.is_dir() || name.starts_with('.') {
            continue;
        }
        let modified_at = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp());
        folders.push(RemoteFolder {
            id: name.clone(),
            name,
            modified_at,
        });
    }
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(folders)
}

/// Recursive copy of `src` into `dest`, which must not exist yet
fn copy_tree(src: &Path, dest: &Path) -> Result<(), RemoteSyncError> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| RemoteSyncError::Download {
            id: src.display().to_string(),
            reason: e.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RemoteSyncError::Download {
                id: src.display().to_string(),
                reason: e.to_string(),
            })?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteContentProvider for DirectoryProvider {
    async fn list_remote_folders(&self) -> Result<Vec<RemoteFolder>, RemoteSyncError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list(&root))
            .await
            .map_err(|e| RemoteSyncError::Listing(e.to_string()))?
    }

    async fn download_folder(&self, id: &str, dest: &Path) -> Result<PathBuf, RemoteSyncError> {
        // Identifiers are plain directory names
        if id.is_empty() || id.contains('/') || id.contains('\\') || id == "." || id == ".." {
            return Err(RemoteSyncError::Download {
                id: id.to_string(),
                reason: "invalid folder identifier".to_string(),
            });
        }

        let src = self.root.join(id);
        if !src.is_dir() {
            return Err(RemoteSyncError::Download {
                id: id.to_string(),
                reason: "folder no longer exists".to_string(),
            });
        }
        let target = dest.join(id);
        let copy_to = target.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &copy_to))
            .await
            .map_err(|e| RemoteSyncError::Download {
                id: id.to_string(),
                reason: e.to_string(),
            })??;
        Ok(target)
    }

    fn name(&self) -> &str {
        "directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lists_visible_directories_only() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("b-post")).unwrap();
        std::fs::create_dir(temp_dir.path().join("a-post")).unwrap();
        std::fs::create_dir(temp_dir.path().join(".trash")).unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();

        let provider = DirectoryProvider::new(temp_dir.path().to_path_buf());
        let folders = provider.list_remote_folders().await.unwrap();
        let ids: Vec<_> = folders.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a-post", "b-post"]);
        assert!(folders[0].modified_at.is_some());
    }

    #[tokio::test]
    async fn test_download_copies_nested_files() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let folder = remote.path().join("launch");
        std::fs::create_dir_all(folder.join("extra")).unwrap();
        std::fs::write(folder.join("1.jpg"), b"one").unwrap();
        std::fs::write(folder.join("extra").join("notes.md"), b"notes").unwrap();

        let provider = DirectoryProvider::new(remote.path().to_path_buf());
        let local = provider.download_folder("launch", staging.path()).await.unwrap();

        assert_eq!(local, staging.path().join("launch"));
        assert_eq!(std::fs::read(local.join("1.jpg")).unwrap(), b"one");
        assert_eq!(std::fs::read(local.join("extra").join("notes.md")).unwrap(), b"notes");
    }

    #[tokio::test]
    async fn test_download_rejects_path_traversal() {
        let remote = TempDir::new().unwrap();
        let provider = DirectoryProvider::new(remote.path().to_path_buf());
        let err = provider.download_folder("../etc", remote.path()).await.unwrap_err();
        assert!(matches!(err, RemoteSyncError::Download { .. }));
    }
}
