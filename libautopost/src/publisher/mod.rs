//! Publishing client abstraction
//!
//! The social platform itself sits outside this crate. Everything the pipeline
//! needs from it is captured by [`Publisher`]: a session check, a login, and
//! one call per post type. Implementations report failures as
//! [`PublishError`], and [`PublishError::is_transient`] decides whether the
//! orchestrator retries.
//!
//! # Examples
//!
//! ```no_run
//! use libautopost::publisher::{Publisher, outbox::OutboxPublisher};
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), libautopost::error::PublishError> {
//! let publisher = OutboxPublisher::new(PathBuf::from("/tmp/outbox"));
//! if !publisher.is_logged_in().await && !publisher.login().await {
//!     return Ok(());
//! }
//! let receipt = publisher
//!     .post_single(&PathBuf::from("/tmp/processed/01.jpg"), "Hello")
//!     .await?;
//! println!("Posted {}", receipt.post_id);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PublishError;
use crate::types::PostType;

// Available in all builds so integration tests and demos can script failures
pub mod mock;
pub mod outbox;

pub type PublishResult = std::result::Result<PublishReceipt, PublishError>;

/// What the platform returns for an accepted post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Platform identifier of the new post
    pub post_id: String,
    /// Short code used in public URLs, when the platform has one
    pub code: Option<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Establish a session. Returns false when credentials are rejected.
    async fn login(&self) -> bool;

    async fn is_logged_in(&self) -> bool;

    async fn post_carousel(&self, images: &[PathBuf], caption: &str) -> PublishResult;

    /// Stories carry no caption
    async fn post_story(&self, images: &[PathBuf]) -> PublishResult;

    async fn post_single(&self, image: &Path, caption: &str) -> PublishResult;

    /// Short name used in logs
    fn name(&self) -> &str;
}

/// Route a post to the publisher call matching its type
pub async fn publish(
    publisher: &dyn Publisher,
    post_type: PostType,
    images: &[PathBuf],
    caption: &str,
) -> PublishResult {
    match post_type {
        PostType::Carousel => publisher.post_carousel(images, caption).await,
        PostType::Story => publisher.post_story(images).await,
        PostType::Single => match images {
            [image] => publisher.post_single(image, caption).await,
            other => Err(PublishError::Validation(format!(
                "single post needs exactly one image, got {}",
                other.len()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPublisher;
    use super::*;

    #[tokio::test]
    async fn test_publish_routes_by_type() {
        let publisher = MockPublisher::success();
        publisher.login().await;
        let images = vec![PathBuf::from("01.jpg"), PathBuf::from("02.jpg")];

        publish(&publisher, PostType::Carousel, &images, "c").await.unwrap();
        publish(&publisher, PostType::Story, &images, "ignored").await.unwrap();
        publish(&publisher, PostType::Single, &images[..1], "s").await.unwrap();

        let kinds: Vec<PostType> = publisher.published().iter().map(|p| p.post_type).collect();
        assert_eq!(kinds, vec![PostType::Carousel, PostType::Story, PostType::Single]);
        assert_eq!(publisher.published()[1].caption, None);
    }

    #[tokio::test]
    async fn test_single_requires_one_image() {
        let publisher = MockPublisher::success();
        let images = vec![PathBuf::from("01.jpg"), PathBuf::from("02.jpg")];

        let err = publish(&publisher, PostType::Single, &images, "s").await.unwrap_err();
        assert!(matches!(err, PublishError::Validation(_)));
        assert_eq!(publisher.post_call_count(), 0);
    }
}
