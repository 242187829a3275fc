//! Scriptable publisher for tests
//!
//! Failures are queued up front and consumed one per post call; once the
//! script runs out every call succeeds (or fails, see [`MockConfig::post_succeeds`]).
//! Counters are shared through `Arc`, so a clone of the publisher observes the
//! same calls.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use super::{PublishReceipt, PublishResult, Publisher};
use crate::error::PublishError;
use crate::types::PostType;

/// One accepted post as the mock saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPost {
    pub post_type: PostType,
    pub images: Vec<PathBuf>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub login_succeeds: bool,
    /// Whether the session starts out valid
    pub logged_in: bool,
    /// Outcome once the script is exhausted
    pub post_succeeds: bool,
    /// Consumed front to back, one entry per post call
    pub script: Arc<Mutex<VecDeque<PublishError>>>,
    pub delay: Duration,
    pub login_calls: Arc<Mutex<usize>>,
    pub post_calls: Arc<Mutex<usize>>,
    pub published: Arc<Mutex<Vec<PublishedPost>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            login_succeeds: true,
            logged_in: false,
            post_succeeds: true,
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            login_calls: Arc::new(Mutex::new(0)),
            post_calls: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[derive(Clone)]
pub struct MockPublisher {
    config: MockConfig,
    session: Arc<AtomicBool>,
}

impl MockPublisher {
    pub fn new(config: MockConfig) -> Self {
        let session = Arc::new(AtomicBool::new(config.logged_in));
        Self { config, session }
    }

    pub fn success() -> Self {
        Self::new(MockConfig::default())
    }

    /// Fail with each error in order, then succeed
    pub fn failing_then_success(failures: Vec<PublishError>) -> Self {
        Self::new(MockConfig {
            script: Arc::new(Mutex::new(failures.into())),
            ..Default::default()
        })
    }

    pub fn always_failing(error: PublishError) -> Self {
        Self::new(MockConfig {
            post_succeeds: false,
            script: Arc::new(Mutex::new(VecDeque::from([error]))),
            ..Default::default()
        })
    }

    pub fn login_failure() -> Self {
        Self::new(MockConfig {
            login_succeeds: false,
            ..Default::default()
        })
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..Default::default()
        })
    }

    pub fn login_call_count(&self) -> usize {
        *self.config.login_calls.lock().unwrap()
    }

    pub fn post_call_count(&self) -> usize {
        *self.config.post_calls.lock().unwrap()
    }

    pub fn published(&self) -> Vec<PublishedPost> {
        self.config.published.lock().unwrap().clone()
    }

    async fn record(&self, post_type: PostType, images: &[PathBuf], caption: Option<&str>) -> PublishResult {
        let call = {
            let mut calls = self.config.post_calls.lock().unwrap();
            *calls += 1;
            *calls
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if !self.session.load(Ordering::SeqCst) {
            return Err(PublishError::Authentication("not logged in".to_string()));
        }

        let scripted = self.config.script.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            // Keep returning the last error when configured to never succeed
            if !self.config.post_succeeds {
                self.config.script.lock().unwrap().push_front(error.clone());
            }
            return Err(error);
        }
        if !self.config.post_succeeds {
            return Err(PublishError::Rejected("mock publisher rejects posts".to_string()));
        }

        self.config.published.lock().unwrap().push(PublishedPost {
            post_type,
            images: images.to_vec(),
            caption: caption.map(str::to_string),
        });
        Ok(PublishReceipt {
            post_id: format!("mock-{}", call),
            code: Some(format!("M{}", call)),
        })
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn login(&self) -> bool {
        *self.config.login_calls.lock().unwrap() += 1;
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }
        self.session.store(self.config.login_succeeds, Ordering::SeqCst);
        self.config.login_succeeds
    }

    async fn is_logged_in(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    async fn post_carousel(&self, images: &[PathBuf], caption: &str) -> PublishResult {
        self.record(PostType::Carousel, images, Some(caption)).await
    }

    async fn post_story(&self, images: &[PathBuf]) -> PublishResult {
        self.record(PostType::Story, images, None).await
    }

    async fn post_single(&self, image: &Path, caption: &str) -> PublishResult {
        self.record(PostType::Single, &[image.to_path_buf()], Some(caption))
            .await
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_login() {
        let publisher = MockPublisher::success();
        let err = publisher.post_story(&[]).await.unwrap_err();
        assert!(matches!(err, PublishError::Authentication(_)));

        assert!(publisher.login().await);
        assert!(publisher.is_logged_in().await);
        assert!(publisher.post_story(&[]).await.is_ok());
        assert_eq!(publisher.login_call_count(), 1);
        assert_eq!(publisher.post_call_count(), 2);
    }

    #[tokio::test]
    async fn test_script_then_success() {
        let publisher = MockPublisher::failing_then_success(vec![
            PublishError::Network("reset".to_string()),
            PublishError::RateLimit("slow down".to_string()),
        ]);
        publisher.login().await;

        assert!(publisher.post_single(Path::new("a.jpg"), "x").await.is_err());
        assert!(publisher.post_single(Path::new("a.jpg"), "x").await.is_err());
        let receipt = publisher.post_single(Path::new("a.jpg"), "x").await.unwrap();
        assert_eq!(receipt.post_id, "mock-3");
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_always_failing_repeats_error() {
        let publisher = MockPublisher::always_failing(PublishError::Network("down".to_string()));
        publisher.login().await;
        for _ in 0..3 {
            assert_eq!(
                publisher.post_story(&[]).await.unwrap_err(),
                PublishError::Network("down".to_string())
            );
        }
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_counters() {
        let publisher = MockPublisher::success();
        let clone = publisher.clone();
        clone.login().await;
        clone.post_story(&[]).await.unwrap();
        assert_eq!(publisher.post_call_count(), 1);
        assert!(publisher.is_logged_in().await);
    }

    #[tokio::test]
    async fn test_login_failure() {
        let publisher = MockPublisher::login_failure();
        assert!(!publisher.login().await);
        assert!(!publisher.is_logged_in().await);
    }
}
