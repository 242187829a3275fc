//! Pulling new content folders from remote storage
//!
//! A provider lists folders and downloads one at a time into a hidden staging
//! directory inside the content root. Finished downloads are renamed into
//! place and registered PENDING, so the posting pipeline never sees
//! half-copied folders. Staging on the same filesystem keeps that rename
//! atomic wherever the content root is mounted.

pub mod directory;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::content::ContentSource;
use crate::db::Database;
use crate::error::{RemoteSyncError, Result};
use crate::service::events::{Event, EventBus};
use crate::types::ContentFolder;

pub use directory::DirectoryProvider;

/// Hidden, so local scans never pick up a download in progress
pub const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFolder {
    /// Stable identifier assigned by the provider
    pub id: String,
    pub name: String,
    pub modified_at: Option<i64>,
}

#[async_trait]
pub trait RemoteContentProvider: Send + Sync {
    async fn list_remote_folders(&self) -> std::result::Result<Vec<RemoteFolder>, RemoteSyncError>;

    /// Download the folder into `dest` and return the directory holding its files
    async fn download_folder(
        &self,
        id: &str,
        dest: &Path,
    ) -> std::result::Result<PathBuf, RemoteSyncError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub remote_count: usize,
    pub materialized_count: usize,
    /// Remote folders not downloaded yet
    pub pending: Vec<String>,
}

pub struct RemoteSync {
    provider: Box<dyn RemoteContentProvider>,
    source: ContentSource,
    db: Database,
    staging: PathBuf,
    concurrency: usize,
    events: EventBus,
}

enum Fetched {
    Registered(ContentFolder),
    Skipped,
    Failed,
}

impl RemoteSync {
    pub fn new(
        provider: Box<dyn RemoteContentProvider>,
        source: ContentSource,
        db: Database,
        concurrency: usize,
        events: EventBus,
    ) -> Self {
        let staging = source.root().join(STAGING_DIR);
        Self {
            provider,
            source,
            db,
            staging,
            concurrency: concurrency.max(1),
            events,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Materialize every remote folder not seen before
    ///
    /// Only a failed listing is an error; individual download failures are
    /// logged and counted.
    pub async fn sync(&self) -> Result<Vec<ContentFolder>> {
        let remote = self.provider.list_remote_folders().await?;
        let known = self.db.known_remote_ids().await?;
        self.source.ensure_layout()?;
        tokio::fs::create_dir_all(&self.staging)
            .await
            .map_err(RemoteSyncError::Io)?;

        let mut skipped = 0;
        let mut wanted = Vec::new();
        let mut names = HashSet::new();
        for folder in remote {
            if known.contains(&folder.id) {
                skipped += 1;
                continue;
            }
            let name = local_name(&folder.name);
            if self.source.root().join(&name).exists() || !names.insert(name.clone()) {
                warn!(remote_id = %folder.id, folder = %name, "A local folder with this name already exists, skipping");
                skipped += 1;
                continue;
            }
            wanted.push((folder, name));
        }

        let results: Vec<Fetched> = stream::iter(wanted)
            .map(|(folder, name)| self.fetch(folder, name))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut downloaded = Vec::new();
        let mut failed = 0;
        for result in results {
            match result {
                Fetched::Registered(folder) => downloaded.push(folder),
                Fetched::Skipped => skipped += 1,
                Fetched::Failed => failed += 1,
            }
        }
        downloaded.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            provider = self.provider.name(),
            downloaded = downloaded.len(),
            skipped,
            failed,
            "Remote sync finished"
        );
        self.events.emit(Event::SyncCompleted {
            downloaded: downloaded.len(),
            skipped,
            failed,
        });
        Ok(downloaded)
    }

    async fn fetch(&self, folder: RemoteFolder, name: String) -> Fetched {
        let staging = self.staging.join(Uuid::new_v4().simple().to_string());
        let result = self.download_and_register(&folder, &name, &staging).await;
        if staging.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                debug!(dir = %staging.display(), error = %e, "Could not remove staging directory");
            }
        }

        match result {
            Ok(Some(local)) => Fetched::Registered(local),
            Ok(None) => Fetched::Skipped,
            Err(e) => {
                warn!(remote_id = %folder.id, folder = %name, error = %e, "Remote folder download failed");
                Fetched::Failed
            }
        }
    }

    async fn download_and_register(
        &self,
        folder: &RemoteFolder,
        name: &str,
        staging: &Path,
    ) -> Result<Option<ContentFolder>> {
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(RemoteSyncError::Io)?;
        let downloaded = self.provider.download_folder(&folder.id, staging).await?;

        let target = self.source.root().join(name);
        if target.exists() {
            warn!(folder = %name, "Folder appeared locally during download, discarding copy");
            return Ok(None);
        }
        tokio::fs::rename(&downloaded, &target)
            .await
            .map_err(RemoteSyncError::Io)?;

        let local = self.source.register(target, Some(folder.id.clone())).await?;
        info!(remote_id = %folder.id, folder = %local.name, id = %local.id, "Downloaded remote folder");
        Ok(Some(local))
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let remote = self.provider.list_remote_folders().await?;
        let known = self.db.known_remote_ids().await?;

        let mut status = SyncStatus {
            remote_count: remote.len(),
            ..SyncStatus::default()
        };
        for folder in remote {
            if known.contains(&folder.id) {
                status.materialized_count += 1;
            } else {
                status.pending.push(folder.name);
            }
        }
        status.pending.sort();
        Ok(status)
    }
}

/// Remote names may contain characters that cannot be a single path component
fn local_name(remote: &str) -> String {
    let cleaned: String = remote
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "remote".to_string(),
        name => name.to_string(),
    }
}
