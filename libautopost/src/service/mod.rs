//! Service layer for AutoPost
//!
//! `AutopostService` is the single entry point used by the daemon and the
//! control CLI. It owns the shared store handle and wires the pipeline
//! together:
//!
//! - `ContentSource` + `PostQueue`: which folders are waiting
//! - `PostOrchestrator`: one posting cycle at a time
//! - `TimeSlotScheduler`: when cycles start on their own
//! - `RemoteSync`: optional pull of new folders from remote storage
//! - `EventBus`: progress events for anyone listening
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libautopost::publisher::outbox::OutboxPublisher;
//! use libautopost::service::AutopostService;
//! use libautopost::Config;
//!
//! # async fn example() -> libautopost::Result<()> {
//! let config = Config::load()?;
//! let publisher = Arc::new(OutboxPublisher::new(config.outbox_dir()));
//! let service = AutopostService::new(config, publisher).await?;
//!
//! let status = service.get_status().await?;
//! println!("next post at {:?}", status.next_run);
//! # Ok(())
//! # }
//! ```

pub mod events;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use self::events::{EventBus, EventReceiver, Trigger};
use crate::config::Config;
use crate::content::{ContentSource, PostQueue};
use crate::db::Database;
use crate::error::{AutopostError, Result};
use crate::imaging::codec::{ImageCodec, ImageCrateCodec};
use crate::imaging::ImageProcessor;
use crate::orchestrator::{CycleOutcome, PostOrchestrator, ReconcileReport, RetryPolicy};
use crate::publisher::Publisher;
use crate::remote::{DirectoryProvider, RemoteContentProvider, RemoteSync, SyncStatus};
use crate::scheduler::slots::{parse_slots, parse_timezone};
use crate::scheduler::{FireHandler, Phase, TimeSlotScheduler};
use crate::types::{ContentFolder, HistoryEntry, HistoryStats, SchedulerState};

/// Snapshot returned by [`AutopostService::get_status`]
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub phase: Phase,
    /// Why automatic posting stopped, if it did
    pub suspended: Option<String>,
    /// A posting cycle is running in this process
    pub busy: bool,
    pub pending: usize,
    pub slots: Vec<String>,
    pub timezone: String,
    pub remote_sync: bool,
}

pub struct AutopostService {
    config: Arc<Config>,
    db: Database,
    source: ContentSource,
    queue: Arc<PostQueue>,
    orchestrator: Arc<PostOrchestrator>,
    scheduler: Arc<TimeSlotScheduler>,
    remote: Option<RemoteSync>,
    sync_interval: Duration,
    event_bus: EventBus,
}

fn from_timestamp(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

impl AutopostService {
    /// Open the store named by the configuration and build the pipeline
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be opened or migrated.
    pub async fn new(config: Config, publisher: Arc<dyn Publisher>) -> Result<Self> {
        config.validate()?;
        let db = Database::new(&config.database_path()).await?;
        Self::with_database(config, db, publisher).await
    }

    /// Build the pipeline on an already open store
    pub async fn with_database(
        config: Config,
        db: Database,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let provider = config
            .remote_source()
            .map(|root| Box::new(DirectoryProvider::new(root)) as Box<dyn RemoteContentProvider>);
        Self::from_parts(config, db, publisher, Arc::new(ImageCrateCodec), provider).await
    }

    /// Build the pipeline from explicit collaborators
    pub async fn from_parts(
        config: Config,
        db: Database,
        publisher: Arc<dyn Publisher>,
        codec: Arc<dyn ImageCodec>,
        provider: Option<Box<dyn RemoteContentProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let event_bus = EventBus::new(100);

        let source = ContentSource::new(db.clone(), config.content_dir());
        source.ensure_layout()?;
        let queue = Arc::new(PostQueue::new());
        let images = ImageProcessor::new(codec, config.data_dir().join("processed"));

        let orchestrator = Arc::new(PostOrchestrator::new(
            db.clone(),
            source.clone(),
            Arc::clone(&queue),
            images,
            publisher,
            event_bus.clone(),
            RetryPolicy::from_config(&config)?,
        ));

        let tz = parse_timezone(&config.schedule.timezone)?;
        let default_slots = parse_slots(&config.schedule.post_times)?;
        let scheduler = Arc::new(
            TimeSlotScheduler::load(db.clone(), tz, default_slots, event_bus.clone()).await?,
        );

        let remote = provider.map(|provider| {
            RemoteSync::new(
                provider,
                source.clone(),
                db.clone(),
                config.remote.download_concurrency,
                event_bus.clone(),
            )
        });

        Ok(Self {
            sync_interval: config.sync_interval()?,
            config,
            db,
            source,
            queue,
            orchestrator,
            scheduler,
            remote,
            event_bus,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn scheduler(&self) -> &TimeSlotScheduler {
        &self.scheduler
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    /// Repair leftovers from a crash, then register new local folders
    pub async fn startup(&self) -> Result<ReconcileReport> {
        let report = self.orchestrator.reconcile().await?;
        let discovered = self.source.scan().await?;
        if !discovered.is_empty() {
            info!(count = discovered.len(), "Registered new content folders");
        }
        Ok(report)
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.orchestrator.reconcile().await
    }

    /// Register directories dropped into the content root since the last scan
    pub async fn scan(&self) -> Result<Vec<ContentFolder>> {
        self.source.scan().await
    }

    /// Post the oldest pending folder now
    pub async fn post_now(&self) -> Result<CycleOutcome> {
        self.source.scan().await?;
        self.orchestrator.post_next(Trigger::Manual).await
    }

    /// Post a specific folder now, regardless of queue order
    pub async fn post_folder(&self, path: &Path) -> Result<CycleOutcome> {
        self.orchestrator.post_folder(path).await
    }

    pub async fn sync_remote(&self) -> Result<Vec<ContentFolder>> {
        let remote = self.remote.as_ref().ok_or_else(|| {
            AutopostError::InvalidInput("remote sync is not configured (remote.source)".to_string())
        })?;
        remote.sync().await
    }

    /// `None` when no remote source is configured
    pub async fn sync_status(&self) -> Result<Option<SyncStatus>> {
        match &self.remote {
            Some(remote) => Ok(Some(remote.sync_status().await?)),
            None => Ok(None),
        }
    }

    /// Delete posted archives older than `days` (configured retention when `None`)
    pub async fn cleanup(&self, days: Option<u32>) -> Result<Vec<ContentFolder>> {
        let days = days.unwrap_or(self.config.cleanup.retention_days);
        self.source.cleanup_posted(days, Utc::now().timestamp()).await
    }

    /// Restore the schedule from configuration and lift any suspension
    pub async fn reset(&self) -> Result<SchedulerState> {
        let state = self.scheduler.reset().await?;
        info!("Scheduler reset to configured defaults");
        Ok(state)
    }

    /// Move a FAILED folder back to PENDING so it is posted again
    pub async fn reset_folder(&self, id: &str) -> Result<ContentFolder> {
        let folder = self.source.reset_folder(id).await?;
        self.queue.enqueue(folder.clone());
        Ok(folder)
    }

    pub async fn get_status(&self) -> Result<ServiceStatus> {
        let state = self.scheduler.state().await;
        let pending = self.source.pending().await?.len();
        Ok(ServiceStatus {
            enabled: state.enabled,
            next_run: from_timestamp(state.next_run),
            last_run: from_timestamp(state.last_run),
            phase: self.scheduler.phase(),
            suspended: state.suspended_reason,
            busy: self.orchestrator.is_busy(),
            pending,
            slots: state.slots.iter().map(|s| s.to_string()).collect(),
            timezone: self.scheduler.timezone().to_string(),
            remote_sync: self.remote.is_some(),
        })
    }

    pub async fn get_history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        self.db.get_history(limit).await
    }

    /// Pending folders in posting order
    pub async fn get_pending(&self) -> Result<Vec<ContentFolder>> {
        self.source.scan().await?;
        self.queue.refresh(self.source.pending().await?);
        Ok(self.queue.list())
    }

    pub async fn stats(&self) -> Result<HistoryStats> {
        self.db.history_stats(Utc::now().timestamp()).await
    }

    pub async fn update_slots<S: AsRef<str>>(&self, times: &[S]) -> Result<SchedulerState> {
        self.scheduler.set_slots(times).await
    }

    pub async fn add_slot(&self, time: &str) -> Result<SchedulerState> {
        self.scheduler.add_slot(time).await
    }

    pub async fn remove_slot(&self, time: &str) -> Result<SchedulerState> {
        self.scheduler.remove_slot(time).await
    }

    pub async fn toggle(&self, enabled: bool) -> Result<SchedulerState> {
        self.scheduler.set_enabled(enabled).await
    }

    /// Pick up scheduler changes written by another process
    pub async fn reload(&self) -> Result<SchedulerState> {
        self.scheduler.reload().await
    }

    fn fire_handler(&self) -> FireHandler {
        let orchestrator = Arc::clone(&self.orchestrator);
        let source = self.source.clone();
        Box::new(move || {
            let orchestrator = Arc::clone(&orchestrator);
            let source = source.clone();
            Box::pin(async move {
                source.scan().await?;
                orchestrator.post_next(Trigger::Scheduled).await
            })
        })
    }

    /// Run the scheduler and the periodic remote sync until `shutdown` turns true
    ///
    /// A cycle in flight when shutdown is requested is allowed to finish.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tokio::join!(
            self.scheduler.run(shutdown.clone(), self.fire_handler()),
            self.sync_loop(shutdown),
        );
    }

    async fn sync_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(remote) = &self.remote else {
            return;
        };
        // `interval` panics on a zero period
        let period = self.sync_interval.max(Duration::from_secs(1));
        info!(
            provider = remote.provider_name(),
            interval = %humantime::format_duration(period),
            "Remote sync enabled"
        );

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = remote.sync().await {
                        warn!(error = %e, "Remote sync failed");
                    }
                }
            }
        }
    }
}
