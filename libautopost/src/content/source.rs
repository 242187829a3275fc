//! Local content folders and their on-disk layout
//!
//! ```text
//! <content root>/
//!   summer-sale/            pending, waiting in the root
//!   posted/summer-sale_20240601_090000/
//!   failed/broken_20240602_150000/
//! ```
//!
//! The store is the source of truth for lifecycle state; the directory a
//! folder lives in mirrors that state and is repaired at startup if the two
//! disagree.

use std::path::{Path, PathBuf};

use crate::db::Database;
use crate::error::{AutopostError, ContentError, Result};
use crate::types::{ContentFolder, FolderState};

pub const POSTED_DIR: &str = "posted";
pub const FAILED_DIR: &str = "failed";

/// Where a folder's directory currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    ContentRoot,
    PostedArchive,
    FailedArchive,
    Missing,
}

#[derive(Clone)]
pub struct ContentSource {
    db: Database,
    root: PathBuf,
}

impl ContentSource {
    pub fn new(db: Database, root: PathBuf) -> Self {
        Self { db, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn posted_dir(&self) -> PathBuf {
        self.root.join(POSTED_DIR)
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.root.clone(), self.posted_dir(), self.failed_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }
        Ok(())
    }

    /// Register every unknown directory in the content root as PENDING
    ///
    /// Returns only the folders that were not known before.
    pub async fn scan(&self) -> Result<Vec<ContentFolder>> {
        self.ensure_layout()?;
        let entries = std::fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))?;

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_dir() || name.starts_with('.') || is_reserved(&name) {
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();

        let mut discovered = Vec::new();
        for path in candidates {
            if self.db.get_folder_by_path(&path).await?.is_some() {
                continue;
            }
            let folder = self.db.register_folder(&ContentFolder::discovered(path, None)).await?;
            tracing::info!(folder = %folder.name, id = %folder.id, "Discovered content folder");
            discovered.push(folder);
        }
        Ok(discovered)
    }

    /// Record a folder that was just materialized in the content root
    pub async fn register(&self, path: PathBuf, remote_id: Option<String>) -> Result<ContentFolder> {
        self.db
            .register_folder(&ContentFolder::discovered(path, remote_id))
            .await
    }

    pub async fn pending(&self) -> Result<Vec<ContentFolder>> {
        self.db.list_folders(Some(FolderState::Pending)).await
    }

    pub async fn list(&self, state: Option<FolderState>) -> Result<Vec<ContentFolder>> {
        self.db.list_folders(state).await
    }

    pub async fn get(&self, id: &str) -> Result<ContentFolder> {
        self.db
            .get_folder(id)
            .await?
            .ok_or_else(|| AutopostError::FolderNotFound(id.to_string()))
    }

    /// Look a folder up by path, registering it if it sits in the content root unknown
    pub async fn find_or_register(&self, path: &Path) -> Result<ContentFolder> {
        let path = if path.is_relative() {
            self.root.join(path)
        } else {
            path.to_path_buf()
        };
        if let Some(folder) = self.db.get_folder_by_path(&path).await? {
            return Ok(folder);
        }
        if !path.is_dir() {
            return Err(AutopostError::FolderNotFound(path.display().to_string()));
        }
        self.register(path, None).await
    }

    /// PENDING -> PROCESSING, or `NotClaimable`
    pub async fn claim(&self, folder: &ContentFolder) -> Result<()> {
        if self.db.claim_folder(&folder.id).await? {
            Ok(())
        } else {
            Err(AutopostError::NotClaimable(folder.name.clone()))
        }
    }

    pub fn location_of(&self, folder: &ContentFolder) -> Location {
        if !folder.path.is_dir() {
            return Location::Missing;
        }
        match folder.path.parent() {
            Some(parent) if parent == self.posted_dir() => Location::PostedArchive,
            Some(parent) if parent == self.failed_dir() => Location::FailedArchive,
            _ => Location::ContentRoot,
        }
    }

    /// Find a folder whose recorded path is gone but that was already moved
    /// into an archive (newest match wins)
    pub fn find_archived(&self, folder: &ContentFolder) -> Option<(Location, PathBuf)> {
        let prefix = format!("{}_", folder.name);
        [
            (Location::PostedArchive, self.posted_dir()),
            (Location::FailedArchive, self.failed_dir()),
        ]
        .into_iter()
        .find_map(|(location, dir)| {
            let mut matches: Vec<PathBuf> = std::fs::read_dir(&dir)
                .ok()?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            matches.sort();
            matches.pop().map(|path| (location, path))
        })
    }

    /// Move a finished folder into the archive matching its state
    ///
    /// The archived name carries a timestamp suffix so repeated names never collide.
    pub async fn archive(&self, folder: &ContentFolder, state: FolderState) -> Result<PathBuf> {
        let archive = match state {
            FolderState::Posted => self.posted_dir(),
            FolderState::Failed => self.failed_dir(),
            other => {
                return Err(AutopostError::InvalidInput(format!(
                    "cannot archive a folder in state {}",
                    other
                )))
            }
        };
        std::fs::create_dir_all(&archive).map_err(|e| io_error(&archive, e))?;

        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let dest = unique_destination(&archive, &format!("{}_{}", folder.name, stamp));
        std::fs::rename(&folder.path, &dest).map_err(|e| io_error(&folder.path, e))?;
        self.db.set_folder_path(&folder.id, &dest).await?;

        tracing::info!(
            folder = %folder.name,
            to = %dest.display(),
            "Archived folder as {}",
            state
        );
        Ok(dest)
    }

    /// Move a FAILED folder back into the content root as PENDING
    pub async fn reset_folder(&self, id: &str) -> Result<ContentFolder> {
        let folder = self.get(id).await?;
        if folder.state != FolderState::Failed {
            return Err(AutopostError::InvalidInput(format!(
                "folder {} is {}, only failed folders can be reset",
                folder.name, folder.state
            )));
        }

        let dest = if self.location_of(&folder) == Location::ContentRoot {
            folder.path.clone()
        } else if folder.path.is_dir() {
            let dest = unique_destination(&self.root, &folder.name);
            std::fs::rename(&folder.path, &dest).map_err(|e| io_error(&folder.path, e))?;
            dest
        } else {
            return Err(AutopostError::FolderNotFound(folder.path.display().to_string()));
        };

        if !self.db.reset_failed_folder(&folder.id, &dest).await? {
            return Err(AutopostError::NotClaimable(folder.name));
        }
        tracing::info!(folder = %folder.name, "Folder reset to pending");
        self.get(id).await
    }

    /// Delete archived POSTED folders completed more than `days` days before `now`
    ///
    /// Store rows are kept so remote dedup and history survive.
    pub async fn cleanup_posted(&self, days: u32, now: i64) -> Result<Vec<ContentFolder>> {
        let cutoff = now - i64::from(days) * 24 * 60 * 60;
        let mut removed = Vec::new();

        for folder in self.db.list_folders(Some(FolderState::Posted)).await? {
            let Some(completed_at) = folder.completed_at else {
                continue;
            };
            if completed_at >= cutoff || self.location_of(&folder) != Location::PostedArchive {
                continue;
            }
            std::fs::remove_dir_all(&folder.path).map_err(|e| io_error(&folder.path, e))?;
            tracing::info!(folder = %folder.name, "Removed old posted folder");
            removed.push(folder);
        }
        Ok(removed)
    }
}

fn is_reserved(name: &str) -> bool {
    name == POSTED_DIR || name == FAILED_DIR
}

fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    (2..)
        .map(|n| dir.join(format!("{}-{}", name, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

fn io_error(path: &Path, e: std::io::Error) -> AutopostError {
    ContentError::Io(format!("{}: {}", path.display(), e)).into()
}
