//! Posting cycles
//!
//! A cycle takes one PENDING folder through claim, parse, image
//! normalization and publishing, then records exactly one history entry and
//! moves the folder to its archive. Only one cycle runs at a time in a
//! process; a second request while one is running gets [`AutopostError::Busy`].
//! Across processes the store-level claim keeps a folder from being published
//! twice.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::content::{parser, ContentSource, Location, PostQueue};
use crate::db::Database;
use crate::error::{AutopostError, PublishError, Result};
use crate::imaging::ImageProcessor;
use crate::publisher::{self, PublishReceipt, Publisher};
use crate::service::events::{Event, EventBus, Trigger};
use crate::types::{ContentFolder, ErrorClass, FolderState, PostContent, PostRecord};

/// Retry behaviour for transient publisher failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Publisher invocations per cycle, including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub publish_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            max_attempts: config.retry.max_attempts.max(1),
            backoff_base: config.backoff_base()?,
            publish_timeout: config.publish_timeout()?,
        })
    }

    /// Wait before attempt `attempt + 1`: `base * 2^(attempt - 1)`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

/// Whole milliseconds, saturating instead of truncating
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Posted {
        folder: ContentFolder,
        record: PostRecord,
    },
    Failed {
        folder: ContentFolder,
        record: PostRecord,
    },
    /// Nothing was pending
    Idle,
}

impl CycleOutcome {
    pub fn record(&self) -> Option<&PostRecord> {
        match self {
            CycleOutcome::Posted { record, .. } | CycleOutcome::Failed { record, .. } => {
                Some(record)
            }
            CycleOutcome::Idle => None,
        }
    }

    /// Reason automatic posting should pause after this outcome
    pub fn suspend_reason(&self) -> Option<String> {
        match self {
            CycleOutcome::Failed { record, .. } if record.error_class == Some(ErrorClass::Auth) => {
                Some(format!(
                    "publisher authentication failed: {}",
                    record.error_message.as_deref().unwrap_or("unknown")
                ))
            }
            _ => None,
        }
    }
}

/// Counts of what startup reconciliation repaired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub recovered_posted: usize,
    pub interrupted: usize,
    pub archived: usize,
    pub vanished: usize,
}

pub struct PostOrchestrator {
    db: Database,
    source: ContentSource,
    queue: Arc<PostQueue>,
    images: ImageProcessor,
    publisher: Arc<dyn Publisher>,
    events: EventBus,
    policy: RetryPolicy,
    gate: Mutex<()>,
}

impl PostOrchestrator {
    pub fn new(
        db: Database,
        source: ContentSource,
        queue: Arc<PostQueue>,
        images: ImageProcessor,
        publisher: Arc<dyn Publisher>,
        events: EventBus,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            db,
            source,
            queue,
            images,
            publisher,
            events,
            policy,
            gate: Mutex::new(()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Post the oldest pending folder
    pub async fn post_next(&self, trigger: Trigger) -> Result<CycleOutcome> {
        let _guard = self.gate.try_lock().map_err(|_| AutopostError::Busy)?;

        self.queue.refresh(self.source.pending().await?);
        while let Some(folder) = self.queue.dequeue_next() {
            match self.run_cycle(folder, trigger).await {
                // Claimed by another process since the refresh
                Err(AutopostError::NotClaimable(name)) => {
                    info!(folder = %name, "Folder already claimed elsewhere, trying next");
                }
                other => return other,
            }
        }
        Ok(CycleOutcome::Idle)
    }

    /// Post a specific folder now, bypassing queue order
    pub async fn post_folder(&self, path: &Path) -> Result<CycleOutcome> {
        let _guard = self.gate.try_lock().map_err(|_| AutopostError::Busy)?;

        let folder = self.source.find_or_register(path).await?;
        if folder.state != FolderState::Pending {
            return Err(AutopostError::NotClaimable(format!(
                "{} ({})",
                folder.name, folder.state
            )));
        }
        self.queue.remove(&folder.id);
        self.run_cycle(folder, Trigger::Manual).await
    }

    async fn run_cycle(&self, folder: ContentFolder, trigger: Trigger) -> Result<CycleOutcome> {
        self.source.claim(&folder).await?;
        info!(folder = %folder.name, id = %folder.id, ?trigger, "Starting posting cycle");
        self.events.emit(Event::CycleStarted {
            folder_id: folder.id.clone(),
            folder_name: folder.name.clone(),
            trigger,
        });

        let content = match parser::parse(&folder.path) {
            Ok(content) => content,
            Err(e) => {
                let record = PostRecord::failure(&folder.id, ErrorClass::Content, e.to_string(), 0);
                return self.finish(folder, record).await;
            }
        };
        if let Err(e) = self.db.set_post_type(&folder.id, content.post_type).await {
            warn!(folder = %folder.name, error = %e, "Could not store post type");
        }

        let images = match self.images.process_folder_async(&folder.id, &content).await {
            Ok(images) => images,
            Err(e) => {
                let record = PostRecord::failure(&folder.id, ErrorClass::Image, e.to_string(), 0);
                return self.finish(folder, record).await;
            }
        };

        let published = self.publish_with_retry(&folder, &content, &images).await;
        self.images.clear(&folder.id);

        let record = match published {
            Ok((receipt, calls)) => PostRecord::success(&folder.id, Some(receipt.post_id), calls),
            Err((e, calls)) => {
                let class = match &e {
                    PublishError::Authentication(_) => ErrorClass::Auth,
                    e if e.is_transient() => ErrorClass::Transient,
                    _ => ErrorClass::Permanent,
                };
                PostRecord::failure(&folder.id, class, e.to_string(), calls)
            }
        };
        self.finish(folder, record).await
    }

    /// Returns the receipt or the final error, each with the number of publisher calls made
    async fn publish_with_retry(
        &self,
        folder: &ContentFolder,
        content: &PostContent,
        images: &[PathBuf],
    ) -> std::result::Result<(PublishReceipt, u32), (PublishError, u32)> {
        let client = self.publisher.as_ref();
        let limit = self.policy.publish_timeout;

        // A hanging session check or login counts as a transient timeout, not an auth failure
        let session = async {
            if client.is_logged_in().await {
                return true;
            }
            client.login().await
        };
        match tokio::time::timeout(limit, session).await {
            Ok(true) => {}
            Ok(false) => {
                return Err((
                    PublishError::Authentication(format!("{} rejected the login", client.name())),
                    0,
                ));
            }
            Err(_) => {
                warn!(folder = %folder.name, "Publisher login did not answer in time");
                return Err((PublishError::Timeout(limit), 0));
            }
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let call = publisher::publish(client, content.post_type, images, &content.caption);
            let result = match tokio::time::timeout(self.policy.publish_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout(self.policy.publish_timeout)),
            };

            match result {
                Ok(receipt) => {
                    if attempt > 1 {
                        info!(folder = %folder.name, attempt, "Published after retrying");
                    }
                    return Ok((receipt, attempt));
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        folder = %folder.name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Transient publish failure, retrying in {:?}",
                        delay
                    );
                    self.events.emit(Event::PublishRetry {
                        folder_id: folder.id.clone(),
                        attempt,
                        delay_ms: millis(delay),
                        error: e.to_string(),
                    });
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(folder = %folder.name, attempt, error = %e, "Publish failed");
                    return Err((e, attempt));
                }
            }
        }
    }

    /// Persist the record and terminal state, then move the folder
    ///
    /// The move is attempted even when persistence fails; startup
    /// reconciliation repairs either half going missing.
    async fn finish(&self, folder: ContentFolder, record: PostRecord) -> Result<CycleOutcome> {
        let terminal = if record.is_success() {
            FolderState::Posted
        } else {
            FolderState::Failed
        };

        let persisted = self.db.finish_cycle(&record).await;
        if let Err(e) = &persisted {
            error!(folder = %folder.name, error = %e, "Failed to record cycle outcome");
        }

        if let Err(e) = self.source.archive(&folder, terminal).await {
            warn!(folder = %folder.name, error = %e, "Failed to move folder to archive");
        }

        let stored = persisted?;
        let folder = self.source.get(&folder.id).await?;

        if stored.is_success() {
            info!(folder = %folder.name, post_id = ?stored.platform_post_id, "Folder posted");
            self.events.emit(Event::CycleCompleted {
                folder_id: folder.id.clone(),
                folder_name: folder.name.clone(),
                post_id: stored.platform_post_id.clone(),
            });
            Ok(CycleOutcome::Posted {
                folder,
                record: stored,
            })
        } else {
            let class = stored.error_class.unwrap_or(ErrorClass::Permanent);
            let message = stored.error_message.clone().unwrap_or_default();
            warn!(folder = %folder.name, %class, error = %message, "Folder failed");
            self.events.emit(Event::CycleFailed {
                folder_id: folder.id.clone(),
                folder_name: folder.name.clone(),
                class,
                error: message,
            });
            Ok(CycleOutcome::Failed {
                folder,
                record: stored,
            })
        }
    }

    /// Repair state left behind by a crash or an earlier persistence failure
    ///
    /// Run once at startup, before the scheduler starts.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.gate.try_lock().map_err(|_| AutopostError::Busy)?;
        let mut report = ReconcileReport::default();

        for folder in self.db.list_folders(Some(FolderState::Processing)).await? {
            let (location, path) = match self.source.location_of(&folder) {
                Location::Missing => match self.source.find_archived(&folder) {
                    Some((location, path)) => (location, Some(path)),
                    None => (Location::Missing, None),
                },
                location => (location, Some(folder.path.clone())),
            };
            if let Some(path) = &path {
                if *path != folder.path {
                    self.db.set_folder_path(&folder.id, path).await?;
                }
            }

            if location == Location::PostedArchive {
                let record = PostRecord::success(&folder.id, None, 0);
                self.db.finish_cycle(&record).await?;
                info!(folder = %folder.name, "Recovered folder that was posted before a crash");
                report.recovered_posted += 1;
            } else {
                let record = PostRecord::failure(
                    &folder.id,
                    ErrorClass::Interrupted,
                    "process stopped while the folder was being published",
                    0,
                );
                self.db.finish_cycle(&record).await?;
                if location == Location::ContentRoot {
                    let current = self.source.get(&folder.id).await?;
                    self.source.archive(&current, FolderState::Failed).await?;
                }
                warn!(folder = %folder.name, "Marked interrupted folder as failed");
                report.interrupted += 1;
            }
        }

        for folder in self.db.list_folders(None).await? {
            match (folder.state, self.source.location_of(&folder)) {
                (FolderState::Posted | FolderState::Failed, Location::ContentRoot) => {
                    self.source.archive(&folder, folder.state).await?;
                    report.archived += 1;
                }
                (FolderState::Pending, Location::Missing) => {
                    if self.db.claim_folder(&folder.id).await? {
                        let record = PostRecord::failure(
                            &folder.id,
                            ErrorClass::Content,
                            "folder directory disappeared",
                            0,
                        );
                        self.db.finish_cycle(&record).await?;
                        warn!(folder = %folder.name, "Pending folder vanished from disk");
                        report.vanished += 1;
                    }
                }
                _ => {}
            }
        }

        if report != ReconcileReport::default() {
            info!(?report, "Reconciliation finished");
        }
        Ok(report)
    }
}
