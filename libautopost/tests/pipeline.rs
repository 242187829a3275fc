//! End-to-end posting cycles through `AutopostService`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libautopost::content::parse;
use libautopost::error::{ContentError, PublishError};
use libautopost::publisher::mock::MockPublisher;
use libautopost::service::events::Event;
use libautopost::types::{ErrorClass, Outcome};
use libautopost::{
    AutopostError, AutopostService, Config, CycleOutcome, FolderState, PostType, ReconcileReport,
};
use tempfile::TempDir;

struct Harness {
    _temp: TempDir,
    config: Config,
    content: PathBuf,
}

fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let content = temp.path().join("content");
    let mut config = Config::default();
    config.paths.content = content.display().to_string();
    config.paths.data = temp.path().join("data").display().to_string();
    config.schedule.timezone = "UTC".to_string();
    config.retry.backoff_base = "1ms".to_string();
    config.retry.publish_timeout = "5s".to_string();
    std::fs::create_dir_all(&content).unwrap();
    Harness {
        _temp: temp,
        config,
        content,
    }
}

fn write_png(path: &Path, width: u32, height: u32) {
    image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]))
        .save(path)
        .unwrap();
}

/// A folder with `slides` numbered PNG slides and an optional caption
fn write_folder(root: &Path, name: &str, slides: usize, caption: Option<&str>) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    for n in 1..=slides {
        write_png(&dir.join(format!("{}.png", n)), 400, 500);
    }
    if let Some(caption) = caption {
        std::fs::write(dir.join("caption.txt"), caption).unwrap();
    }
    dir
}

async fn service(h: &Harness, publisher: Arc<MockPublisher>) -> AutopostService {
    let service = AutopostService::new(h.config.clone(), publisher).await.unwrap();
    service.startup().await.unwrap();
    service
}

fn archived_in(dir: &Path, name: &str) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_string_lossy().starts_with(&format!("{}_", name)))
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn test_carousel_is_published_and_archived() {
    let h = harness();
    write_folder(&h.content, "launch", 2, Some("New collection #launch"));
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;
    let mut events = service.subscribe();

    let outcome = service.post_now().await.unwrap();
    let CycleOutcome::Posted { folder, record } = outcome else {
        panic!("expected a posted outcome, got {:?}", outcome);
    };

    assert_eq!(folder.state, FolderState::Posted);
    assert_eq!(folder.post_type, Some(PostType::Carousel));
    assert!(folder.completed_at.is_some());
    assert_eq!(record.publish_calls, 1);
    assert_eq!(record.attempt, 1);
    assert_eq!(record.platform_post_id.as_deref(), Some("mock-1"));

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].post_type, PostType::Carousel);
    assert_eq!(published[0].images.len(), 2);
    assert_eq!(published[0].caption.as_deref(), Some("New collection #launch"));

    assert!(!h.content.join("launch").exists());
    assert!(archived_in(&h.content.join("posted"), "launch"));
    assert!(folder.path.starts_with(h.content.join("posted")));

    // Normalized images are removed once the cycle is over
    let processed = h.config.data_dir().join("processed").join(&folder.id);
    assert!(!processed.exists());

    assert!(matches!(events.recv().await.unwrap(), Event::CycleStarted { .. }));
    assert!(matches!(events.recv().await.unwrap(), Event::CycleCompleted { .. }));

    let history = service.get_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].folder_name, "launch");
    assert_eq!(history[0].record.outcome, Outcome::Success);
}

#[tokio::test]
async fn test_queue_order_follows_discovery() {
    let h = harness();
    write_folder(&h.content, "b-second", 1, Some("second"));
    write_folder(&h.content, "a-first", 1, Some("first"));
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;

    // Same discovery second, so the name breaks the tie
    let pending: Vec<_> = service
        .get_pending()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(pending, vec!["a-first", "b-second"]);

    service.post_now().await.unwrap();
    assert_eq!(publisher.published()[0].post_type, PostType::Single);
    assert_eq!(publisher.published()[0].caption.as_deref(), Some("first"));

    let pending = service.get_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "b-second");
}

#[tokio::test]
async fn test_two_transient_failures_then_success() {
    let h = harness();
    write_folder(&h.content, "retry-me", 3, Some("third time lucky"));
    let publisher = Arc::new(MockPublisher::failing_then_success(vec![
        PublishError::Network("connection reset".to_string()),
        PublishError::RateLimit("slow down".to_string()),
    ]));
    let service = service(&h, publisher.clone()).await;

    let outcome = service.post_now().await.unwrap();
    let record = outcome.record().unwrap();
    assert!(record.is_success());
    assert_eq!(record.publish_calls, 3);
    assert_eq!(publisher.post_call_count(), 3);

    let CycleOutcome::Posted { folder, .. } = outcome else {
        panic!("expected posted");
    };
    let records = service
        .database()
        .records_for_folder(&folder.id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records.iter().filter(|r| r.is_success()).count(), 1);
    assert_eq!(records.iter().filter(|r| !r.is_success()).count(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_fail_as_transient() {
    let h = harness();
    write_folder(&h.content, "flaky", 1, Some("never makes it"));
    let publisher = Arc::new(MockPublisher::always_failing(PublishError::Network(
        "unreachable".to_string(),
    )));
    let service = service(&h, publisher.clone()).await;

    let outcome = service.post_now().await.unwrap();
    let CycleOutcome::Failed { folder, record } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(record.error_class, Some(ErrorClass::Transient));
    assert_eq!(record.publish_calls, 3);
    assert_eq!(publisher.post_call_count(), 3);
    assert_eq!(folder.state, FolderState::Failed);
    assert!(archived_in(&h.content.join("failed"), "flaky"));

    // Failed folders are not picked up again on their own
    assert!(matches!(service.post_now().await.unwrap(), CycleOutcome::Idle));
}

#[tokio::test]
async fn test_permanent_rejection_is_not_retried() {
    let h = harness();
    write_folder(&h.content, "rejected", 1, Some("nope"));
    let publisher = Arc::new(MockPublisher::always_failing(PublishError::Validation(
        "caption flagged".to_string(),
    )));
    let service = service(&h, publisher.clone()).await;

    let outcome = service.post_now().await.unwrap();
    assert_eq!(outcome.record().unwrap().error_class, Some(ErrorClass::Permanent));
    assert_eq!(publisher.post_call_count(), 1);
}

#[tokio::test]
async fn test_rejected_login_is_auth_failure() {
    let h = harness();
    write_folder(&h.content, "locked-out", 1, Some("hello"));
    let publisher = Arc::new(MockPublisher::login_failure());
    let service = service(&h, publisher.clone()).await;

    let outcome = service.post_now().await.unwrap();
    assert_eq!(outcome.record().unwrap().error_class, Some(ErrorClass::Auth));
    assert!(outcome.suspend_reason().is_some());
    assert_eq!(publisher.login_call_count(), 1);
    assert_eq!(publisher.post_call_count(), 0);
}

#[tokio::test]
async fn test_missing_caption_fails_without_publishing() {
    let h = harness();
    let dir = write_folder(&h.content, "no-caption", 2, None);
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;

    // Parsing alone changes nothing
    assert!(matches!(parse(&dir), Err(ContentError::MissingCaption(_))));
    let pending = service.get_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, FolderState::Pending);
    assert!(service.get_history(10).await.unwrap().is_empty());

    let outcome = service.post_now().await.unwrap();
    let record = outcome.record().unwrap();
    assert_eq!(record.error_class, Some(ErrorClass::Content));
    assert_eq!(record.publish_calls, 0);
    assert_eq!(publisher.post_call_count(), 0);
    assert!(archived_in(&h.content.join("failed"), "no-caption"));
}

#[tokio::test]
async fn test_tiny_image_fails_as_image_error() {
    let h = harness();
    let dir = write_folder(&h.content, "tiny", 0, Some("small"));
    write_png(&dir.join("1.png"), 100, 100);
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;

    let outcome = service.post_now().await.unwrap();
    assert_eq!(outcome.record().unwrap().error_class, Some(ErrorClass::Image));
    assert_eq!(publisher.post_call_count(), 0);
}

#[tokio::test]
async fn test_story_folder_is_posted_without_caption() {
    let h = harness();
    let dir = h.content.join("story-day");
    std::fs::create_dir_all(&dir).unwrap();
    write_png(&dir.join("story_1.png"), 400, 700);
    write_png(&dir.join("story_2.png"), 400, 700);
    std::fs::write(dir.join("caption.txt"), "unused for stories").unwrap();
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;

    service.post_now().await.unwrap();
    let published = publisher.published();
    assert_eq!(published[0].post_type, PostType::Story);
    assert_eq!(published[0].images.len(), 2);
    assert_eq!(published[0].caption, None);
}

#[tokio::test]
async fn test_simultaneous_triggers_run_one_cycle() {
    let h = harness();
    write_folder(&h.content, "one", 1, Some("one"));
    write_folder(&h.content, "two", 1, Some("two"));
    let publisher = Arc::new(MockPublisher::with_delay(Duration::from_millis(300)));
    let service = service(&h, publisher.clone()).await;

    let (a, b) = tokio::join!(service.post_now(), service.post_now());
    let results = [a, b];
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(AutopostError::Busy)))
            .count(),
        1
    );
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Ok(CycleOutcome::Posted { .. })))
            .count(),
        1
    );
    assert_eq!(publisher.post_call_count(), 1);
    assert_eq!(service.get_pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_folder_never_gets_two_successes() {
    let h = harness();
    write_folder(&h.content, "once", 1, Some("only once"));
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;

    let CycleOutcome::Posted { folder, record } = service.post_now().await.unwrap() else {
        panic!("expected posted");
    };
    assert!(service.get_pending().await.unwrap().is_empty());

    // Asking for the archived folder again is refused
    let err = service.post_folder(&folder.path).await.unwrap_err();
    assert!(matches!(err, AutopostError::NotClaimable(_)));

    // The store refuses a second success row outright
    assert!(service.database().add_to_history(&record).await.is_err());
    let successes = service
        .database()
        .records_for_folder(&folder.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.is_success())
        .count();
    assert_eq!(successes, 1);
    assert_eq!(publisher.post_call_count(), 1);
}

#[tokio::test]
async fn test_post_folder_bypasses_queue_order() {
    let h = harness();
    write_folder(&h.content, "a-older", 1, Some("older"));
    write_folder(&h.content, "z-chosen", 1, Some("chosen"));
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;

    let outcome = service.post_folder(Path::new("z-chosen")).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Posted { .. }));
    assert_eq!(publisher.published()[0].caption.as_deref(), Some("chosen"));

    let pending: Vec<_> = service
        .get_pending()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(pending, vec!["a-older"]);

    assert!(matches!(
        service.post_folder(Path::new("missing")).await,
        Err(AutopostError::FolderNotFound(_))
    ));
}

#[tokio::test]
async fn test_reset_folder_retries_failed_folder() {
    let h = harness();
    let dir = write_folder(&h.content, "fix-me", 1, None);
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher.clone()).await;

    let CycleOutcome::Failed { folder, .. } = service.post_now().await.unwrap() else {
        panic!("expected failure");
    };

    // Fix the folder in the failed archive, then send it back
    std::fs::write(folder.path.join("caption.txt"), "fixed").unwrap();
    let reset = service.reset_folder(&folder.id).await.unwrap();
    assert_eq!(reset.state, FolderState::Pending);
    assert_eq!(reset.path, dir);

    let outcome = service.post_now().await.unwrap();
    let record = outcome.record().unwrap();
    assert!(record.is_success());
    assert_eq!(record.attempt, 2);

    assert!(matches!(
        service.reset_folder(&folder.id).await,
        Err(AutopostError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_cleanup_removes_only_old_posted_folders() {
    let h = harness();
    write_folder(&h.content, "posted-one", 1, Some("ok"));
    write_folder(&h.content, "zz-broken", 1, None);
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher).await;

    let CycleOutcome::Posted { folder: posted, .. } = service.post_now().await.unwrap() else {
        panic!("expected posted");
    };
    let CycleOutcome::Failed { folder: failed, .. } = service.post_now().await.unwrap() else {
        panic!("expected failure");
    };

    // Nothing is 30 days old yet
    assert!(service.cleanup(Some(30)).await.unwrap().is_empty());
    assert!(posted.path.exists());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let removed = service.cleanup(Some(0)).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id, posted.id);
    assert!(!posted.path.exists());
    assert!(failed.path.exists());

    // History survives cleanup
    assert_eq!(service.get_history(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_reconcile_after_crash() {
    let h = harness();
    write_folder(&h.content, "was-posted", 1, Some("a"));
    write_folder(&h.content, "was-running", 1, Some("b"));
    write_folder(&h.content, "vanished", 1, Some("c"));
    let publisher = Arc::new(MockPublisher::success());
    let service = service(&h, publisher).await;
    let db = service.database().clone();

    let folders = service.get_pending().await.unwrap();
    let by_name = |name: &str| folders.iter().find(|f| f.name == name).unwrap().clone();

    // Crash after the move but before the store update
    let was_posted = by_name("was-posted");
    assert!(db.claim_folder(&was_posted.id).await.unwrap());
    let archived = h.content.join("posted").join("was-posted_20240101_090000");
    std::fs::create_dir_all(h.content.join("posted")).unwrap();
    std::fs::rename(&was_posted.path, &archived).unwrap();

    // Crash in the middle of publishing
    let was_running = by_name("was-running");
    assert!(db.claim_folder(&was_running.id).await.unwrap());

    std::fs::remove_dir_all(by_name("vanished").path).unwrap();

    let report = service.reconcile().await.unwrap();
    assert_eq!(report.recovered_posted, 1);
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.vanished, 1);

    let recovered = db.get_folder(&was_posted.id).await.unwrap().unwrap();
    assert_eq!(recovered.state, FolderState::Posted);
    assert_eq!(recovered.path, archived);

    let interrupted = db.records_for_folder(&was_running.id).await.unwrap();
    assert_eq!(interrupted[0].error_class, Some(ErrorClass::Interrupted));
    assert!(archived_in(&h.content.join("failed"), "was-running"));

    // Running it again finds nothing to repair
    assert_eq!(service.reconcile().await.unwrap(), ReconcileReport::default());
}

#[tokio::test]
async fn test_status_reflects_schedule_and_queue() {
    let h = harness();
    write_folder(&h.content, "waiting", 1, Some("soon"));
    let service = service(&h, Arc::new(MockPublisher::success())).await;

    let status = service.get_status().await.unwrap();
    assert!(status.enabled);
    assert!(!status.busy);
    assert_eq!(status.pending, 1);
    assert_eq!(status.slots, vec!["09:00", "15:00", "21:00"]);
    assert_eq!(status.timezone, "UTC");
    assert!(status.next_run.is_some());
    assert!(!status.remote_sync);

    service.toggle(false).await.unwrap();
    let status = service.get_status().await.unwrap();
    assert!(!status.enabled);
    assert!(status.next_run.is_none());

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.total_success, 0);
}

#[tokio::test]
async fn test_scheduler_state_survives_restart() {
    let h = harness();
    let service = service(&h, Arc::new(MockPublisher::success())).await;
    service.update_slots(&["08:15", "20:45"]).await.unwrap();
    service.toggle(false).await.unwrap();
    drop(service);

    let restarted = service_again(&h).await;
    let status = restarted.get_status().await.unwrap();
    assert_eq!(status.slots, vec!["08:15", "20:45"]);
    assert!(!status.enabled);

    let state = restarted.reset().await.unwrap();
    assert!(state.enabled);
    assert_eq!(state.slots.len(), 3);
}

async fn service_again(h: &Harness) -> AutopostService {
    AutopostService::new(h.config.clone(), Arc::new(MockPublisher::success()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_hanging_login_is_bounded_by_publish_timeout() {
    let mut h = harness();
    h.config.retry.publish_timeout = "100ms".to_string();
    h.config.retry.max_attempts = 1;
    write_folder(&h.content, "slow", 1, Some("waiting"));
    let publisher = Arc::new(MockPublisher::with_delay(Duration::from_secs(3)));
    let service = service(&h, publisher.clone()).await;

    let started = std::time::Instant::now();
    let outcome = service.post_now().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let CycleOutcome::Failed { record, .. } = outcome else {
        panic!("expected a failed outcome, got {:?}", outcome);
    };
    assert_eq!(record.error_class, Some(ErrorClass::Transient));
    assert_eq!(record.publish_calls, 0);
    assert_eq!(publisher.login_call_count(), 1);
    assert_eq!(publisher.post_call_count(), 0);

    // The gate is free again for the next trigger
    assert!(!service.get_status().await.unwrap().busy);
}

#[tokio::test]
async fn test_zero_sync_interval_is_rejected_at_startup() {
    let mut h = harness();
    let remote = h.content.parent().unwrap().join("remote");
    std::fs::create_dir_all(&remote).unwrap();
    h.config.remote.source = Some(remote.display().to_string());
    h.config.remote.sync_interval = "0s".to_string();

    let result = AutopostService::new(h.config.clone(), Arc::new(MockPublisher::success())).await;
    let err = result.err().expect("zero interval must be rejected");
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("remote.sync_interval"));
}
